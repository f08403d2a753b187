//! Fuzz target: QEMU argument rewriting.
//!
//! The rewritten list must end with exactly one redirection pair per
//! mapping, and rewriting it again must not change it.

#![no_main]

use cloudlet_core::PortMappings;
use cloudlet_svm::redirect_args;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|input: (Vec<String>, Vec<(u16, u16)>)| {
    let (args, rules) = input;
    let mut mappings = PortMappings::new();
    for (host, guest) in rules {
        let _ = mappings.insert(host, guest);
    }

    let once = redirect_args(&args, &mappings);
    assert!(once.len() >= 2 * mappings.len());
    let twice = redirect_args(&once, &mappings);
    assert_eq!(once, twice, "rewriting must be idempotent");
});
