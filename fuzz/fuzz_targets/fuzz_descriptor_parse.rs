//! Fuzz target: domain descriptor parsing and editing.
//!
//! Arbitrary documents must either be rejected or survive every edit and
//! re-serialize without panicking.

#![no_main]

use std::path::Path;

use cloudlet_core::PortMappings;
use cloudlet_svm::DomainDescriptor;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(xml) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(mut descriptor) = DomainDescriptor::parse(xml) else {
        return;
    };

    let _ = descriptor.set_disk_image(Path::new("/vms/fuzz.qcow2"), "qcow2");
    let _ = descriptor.set_uuid("6f1c2d9a-0000-4000-8000-000000000001");
    let _ = descriptor.vnc_port();
    descriptor.enable_remote_vnc();
    let _ = descriptor.enable_bridged();

    let mut mappings = PortMappings::new();
    let _ = mappings.insert(8080, 80);
    descriptor.set_port_redirection(&mappings);

    if let Ok(out) = descriptor.to_xml_string() {
        let reparsed = DomainDescriptor::parse(&out);
        assert!(reparsed.is_ok(), "serialized descriptor must parse again");
    }
});
