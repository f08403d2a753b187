//! Domain descriptor transformer.
//!
//! Wraps one parsed libvirt domain XML document and exposes typed edits for
//! the fields the lifecycle layer keeps in sync with runtime state: primary
//! disk, identity, VNC console, network attachment and the QEMU
//! command-line port redirections. Everything else in the document is left
//! untouched.
//!
//! # Schema reference
//! <https://libvirt.org/formatdomain.html> and
//! <https://libvirt.org/drvqemu.html#pass-through-of-arbitrary-qemu-commands>

use std::path::{Path, PathBuf};

use cloudlet_core::PortMappings;
use xmltree::{Element, EmitterConfig, Namespace, XMLNode};

use crate::VmError;

/// Namespace of the `<qemu:commandline>` pass-through block.
pub const QEMU_NAMESPACE: &str = "http://libvirt.org/schemas/domain/qemu/1.0";

/// Host bridge used by [`DomainDescriptor::enable_bridged`].
pub const DEFAULT_BRIDGE: &str = "br0";

/// Organizationally unique prefix of generated MAC addresses.
pub const MAC_PREFIX: [u8; 3] = [0x00, 0x16, 0x3e];

/// QEMU flag that precedes each port redirection rule.
pub const REDIRECT_FLAG: &str = "-redir";

const QEMU_PREFIX: &str = "qemu";
const TCP_RULE_MARKER: &str = "tcp:";
const USB_MARKER: &str = "-usb";
const WILDCARD_ADDRESS: &str = "0.0.0.0";

/// A mutable libvirt domain description.
#[derive(Debug, Clone)]
pub struct DomainDescriptor {
    root: Element,
}

impl DomainDescriptor {
    /// Parse a domain XML document.
    ///
    /// # Errors
    /// Returns [`VmError::Configuration`] if the document is not well-formed.
    pub fn parse(xml: &str) -> Result<Self, VmError> {
        let root = Element::parse(xml.as_bytes())
            .map_err(|e| VmError::Configuration(format!("malformed domain descriptor: {e}")))?;
        Ok(Self { root })
    }

    /// Serialize back to XML, indented and without an XML declaration.
    ///
    /// # Errors
    /// Returns [`VmError::Configuration`] if the document cannot be written.
    pub fn to_xml_string(&self) -> Result<String, VmError> {
        let mut out = Vec::new();
        let config = EmitterConfig::new()
            .perform_indent(true)
            .write_document_declaration(false);
        self.root
            .write_with_config(&mut out, config)
            .map_err(|e| VmError::Configuration(format!("cannot serialize domain descriptor: {e}")))?;
        String::from_utf8(out)
            .map_err(|e| VmError::Configuration(format!("domain descriptor is not UTF-8: {e}")))
    }

    /// Point the primary disk at `path` (made absolute) with `format`.
    ///
    /// The primary disk is the first `<disk>` whose `device` is `disk`
    /// (libvirt's default when the attribute is omitted).
    ///
    /// # Errors
    /// Returns [`VmError::Configuration`] if there is no primary disk, or it
    /// has no `<source>` or `<driver>` node.
    pub fn set_disk_image(&mut self, path: &Path, format: &str) -> Result<(), VmError> {
        let absolute = std::path::absolute(path).map_err(|e| {
            VmError::Configuration(format!("cannot resolve disk path {}: {e}", path.display()))
        })?;
        let disk = self
            .primary_disk_mut()
            .ok_or_else(|| VmError::Configuration("no disk found in domain descriptor".to_owned()))?;
        if child(disk, "source").is_none() || child(disk, "driver").is_none() {
            return Err(VmError::Configuration(
                "primary disk has no <source> or <driver> node".to_owned(),
            ));
        }
        if let Some(source) = child_mut(disk, "source") {
            set_attr(source, "file", &absolute.to_string_lossy());
        }
        if let Some(driver) = child_mut(disk, "driver") {
            set_attr(driver, "type", format);
        }
        Ok(())
    }

    /// Path and format of the primary disk.
    ///
    /// # Errors
    /// Returns [`VmError::Configuration`] if there is no primary disk or it
    /// lacks a source file or driver type.
    pub fn disk_image(&self) -> Result<(PathBuf, String), VmError> {
        let missing = || VmError::Configuration("primary disk is incomplete".to_owned());
        let disk = child(&self.root, "devices")
            .and_then(|devices| elements(devices, "disk").find(|d| is_primary_disk(d)))
            .ok_or_else(|| VmError::Configuration("no disk found in domain descriptor".to_owned()))?;
        let file = child(disk, "source").and_then(|s| attr(s, "file")).ok_or_else(missing)?;
        let format = child(disk, "driver").and_then(|d| attr(d, "type")).ok_or_else(missing)?;
        Ok((PathBuf::from(file), format.to_owned()))
    }

    /// Set the domain UUID.
    ///
    /// # Errors
    /// Returns [`VmError::Configuration`] if there is no `<uuid>` node.
    pub fn set_uuid(&mut self, uuid: &str) -> Result<(), VmError> {
        let node = self.root.get_mut_child("uuid").ok_or_else(|| missing_node("uuid"))?;
        set_text(node, uuid);
        Ok(())
    }

    /// The domain UUID.
    ///
    /// # Errors
    /// Returns [`VmError::Configuration`] if there is no `<uuid>` node.
    pub fn uuid(&self) -> Result<String, VmError> {
        let node = self.root.get_child("uuid").ok_or_else(|| missing_node("uuid"))?;
        Ok(text_of(node))
    }

    /// Set the domain name.
    ///
    /// # Errors
    /// Returns [`VmError::Configuration`] if there is no `<name>` node.
    pub fn set_name(&mut self, name: &str) -> Result<(), VmError> {
        let node = self.root.get_mut_child("name").ok_or_else(|| missing_node("name"))?;
        set_text(node, name);
        Ok(())
    }

    /// The domain name.
    ///
    /// # Errors
    /// Returns [`VmError::Configuration`] if there is no `<name>` node.
    pub fn name(&self) -> Result<String, VmError> {
        let node = self.root.get_child("name").ok_or_else(|| missing_node("name"))?;
        Ok(text_of(node))
    }

    /// Port the VNC server listens on.
    ///
    /// Only live descriptors carry a usable port; templates with
    /// `autoport` report `-1`, which is rejected.
    ///
    /// # Errors
    /// Returns [`VmError::Configuration`] if there is no VNC graphics
    /// device or its port is absent or unassigned.
    pub fn vnc_port(&self) -> Result<u16, VmError> {
        let graphics = child(&self.root, "devices")
            .and_then(|devices| elements(devices, "graphics").find(|g| attr(g, "type") == Some("vnc")))
            .ok_or_else(|| VmError::Configuration("no VNC graphics device in domain descriptor".to_owned()))?;
        let port = attr(graphics, "port")
            .ok_or_else(|| VmError::Configuration("VNC graphics device has no port".to_owned()))?;
        port.parse()
            .map_err(|_| VmError::Configuration(format!("VNC port {port:?} is not assigned")))
    }

    /// Make the VNC server listen on all host interfaces.
    ///
    /// Callers are responsible for any access control. Does nothing if the
    /// descriptor has no VNC device.
    pub fn enable_remote_vnc(&mut self) {
        let Some(devices) = self.root.get_mut_child("devices") else {
            return;
        };
        for graphics in elements_mut(devices, "graphics") {
            if attr(graphics, "type") != Some("vnc") {
                continue;
            }
            set_attr(graphics, "listen", WILDCARD_ADDRESS);
            for listen in elements_mut(graphics, "listen") {
                if attr(listen, "type") == Some("address") {
                    set_attr(listen, "address", WILDCARD_ADDRESS);
                }
            }
        }
    }

    /// Replace user-mode networking with an interface on [`DEFAULT_BRIDGE`].
    ///
    /// # Errors
    /// See [`DomainDescriptor::enable_bridged_on`].
    pub fn enable_bridged(&mut self) -> Result<String, VmError> {
        self.enable_bridged_on(DEFAULT_BRIDGE)
    }

    /// Remove every user-mode interface and attach a new interface with a
    /// random MAC to `bridge`. Returns the MAC.
    ///
    /// # Errors
    /// Returns [`VmError::Configuration`] if there is no `<devices>` node.
    pub fn enable_bridged_on(&mut self, bridge: &str) -> Result<String, VmError> {
        let devices = self
            .root
            .get_mut_child("devices")
            .ok_or_else(|| missing_node("devices"))?;
        devices.children.retain(|node| {
            !matches!(node, XMLNode::Element(e) if e.name == "interface" && attr(e, "type") == Some("user"))
        });

        let mac = random_mac();
        let mut source = Element::new("source");
        set_attr(&mut source, "bridge", bridge);
        let mut mac_node = Element::new("mac");
        set_attr(&mut mac_node, "address", &mac);
        let mut interface = Element::new("interface");
        set_attr(&mut interface, "type", "bridge");
        interface.children.push(XMLNode::Element(source));
        interface.children.push(XMLNode::Element(mac_node));
        devices.children.push(XMLNode::Element(interface));

        tracing::debug!(%mac, bridge, "bridged interface added to descriptor");
        Ok(mac)
    }

    /// `(type, mac)` of every network interface, in document order.
    #[must_use]
    pub fn interfaces(&self) -> Vec<(String, Option<String>)> {
        let Some(devices) = child(&self.root, "devices") else {
            return Vec::new();
        };
        elements(devices, "interface")
            .map(|iface| {
                let kind = attr(iface, "type").unwrap_or_default().to_owned();
                let mac = child(iface, "mac").and_then(|m| attr(m, "address")).map(str::to_owned);
                (kind, mac)
            })
            .collect()
    }

    /// Rewrite the QEMU command-line arguments so they forward exactly the
    /// given TCP ports. See [`redirect_args`] for the rewrite rules.
    ///
    /// The `<qemu:commandline>` block (and its namespace declaration) is
    /// created if missing. Non-argument children such as `<qemu:env>` are
    /// kept after the arguments.
    pub fn set_port_redirection(&mut self, mappings: &PortMappings) {
        let namespaces = self.root.namespaces.get_or_insert_with(Namespace::empty);
        if namespaces.get(QEMU_PREFIX).is_none() {
            namespaces.put(QEMU_PREFIX, QEMU_NAMESPACE);
        }

        let position = match self.root.children.iter().position(is_qemu_commandline) {
            Some(position) => position,
            None => {
                self.root
                    .children
                    .push(XMLNode::Element(qemu_element("commandline", Some(QEMU_PREFIX))));
                self.root.children.len() - 1
            }
        };
        let XMLNode::Element(commandline) = &mut self.root.children[position] else {
            return;
        };

        let prefix = commandline.prefix.clone();
        let (args, rest): (Vec<XMLNode>, Vec<XMLNode>) = std::mem::take(&mut commandline.children)
            .into_iter()
            .partition(is_qemu_arg);
        let current: Vec<String> = args
            .iter()
            .filter_map(as_element)
            .map(|arg| attr(arg, "value").unwrap_or_default().to_owned())
            .collect();

        commandline.children = redirect_args(&current, mappings)
            .into_iter()
            .map(|value| {
                let mut arg = qemu_element("arg", prefix.as_deref());
                set_attr(&mut arg, "value", &value);
                XMLNode::Element(arg)
            })
            .chain(rest)
            .collect();
    }

    /// Values of the `<qemu:arg>` nodes, in order.
    #[must_use]
    pub fn qemu_args(&self) -> Vec<String> {
        self.root
            .children
            .iter()
            .filter_map(as_element)
            .filter(|e| is_qemu(e, "commandline"))
            .flat_map(|commandline| {
                commandline
                    .children
                    .iter()
                    .filter_map(as_element)
                    .filter(|e| is_qemu(e, "arg"))
                    .map(|arg| attr(arg, "value").unwrap_or_default().to_owned())
            })
            .collect()
    }

    fn primary_disk_mut(&mut self) -> Option<&mut Element> {
        let devices = self.root.get_mut_child("devices")?;
        elements_mut(devices, "disk").find(|disk| is_primary_disk(disk))
    }
}

/// Rewrite an ordered QEMU argument list to carry exactly `mappings`.
///
/// Scanning left to right, the most recent argument containing
/// [`REDIRECT_FLAG`] is remembered. An argument containing `tcp:` is
/// dropped together with that remembered flag. Any argument containing
/// `-usb` is dropped. One `-redir`, `tcp:<host>::<guest>` pair per mapping is
/// then appended. Matching is by substring, and every other argument keeps
/// its relative order.
///
/// Existing `tcp:` rules are always cleaned out, so applying the same
/// mappings twice yields the same list as applying them once.
#[must_use]
pub fn redirect_args(args: &[String], mappings: &PortMappings) -> Vec<String> {
    let mut keep = vec![true; args.len()];
    let mut last_flag = None;
    for (index, value) in args.iter().enumerate() {
        if value.contains(REDIRECT_FLAG) {
            last_flag = Some(index);
            continue;
        }
        if value.contains(TCP_RULE_MARKER) {
            keep[index] = false;
            if let Some(flag) = last_flag.take() {
                keep[flag] = false;
            }
        }
        if value.contains(USB_MARKER) {
            keep[index] = false;
        }
    }

    let mut rewritten: Vec<String> = args
        .iter()
        .zip(keep)
        .filter_map(|(value, keep)| keep.then(|| value.clone()))
        .collect();
    for (host_port, guest_port) in mappings.iter() {
        rewritten.push(REDIRECT_FLAG.to_owned());
        rewritten.push(format!("{TCP_RULE_MARKER}{host_port}::{guest_port}"));
    }
    rewritten
}

/// A random MAC under [`MAC_PREFIX`].
#[must_use]
pub fn random_mac() -> String {
    format_mac(rand::random())
}

/// Format a MAC from [`MAC_PREFIX`] and the three trailing bytes.
#[must_use]
pub fn format_mac(tail: [u8; 3]) -> String {
    MAC_PREFIX
        .iter()
        .chain(tail.iter())
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn missing_node(name: &str) -> VmError {
    VmError::Configuration(format!("no <{name}> node found in domain descriptor"))
}

fn as_element(node: &XMLNode) -> Option<&Element> {
    match node {
        XMLNode::Element(e) => Some(e),
        _ => None,
    }
}

fn child<'a>(parent: &'a Element, name: &'a str) -> Option<&'a Element> {
    elements(parent, name).next()
}

fn child_mut<'a>(parent: &'a mut Element, name: &'a str) -> Option<&'a mut Element> {
    elements_mut(parent, name).next()
}

fn elements<'a>(parent: &'a Element, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
    parent
        .children
        .iter()
        .filter_map(as_element)
        .filter(move |e| e.name == name)
}

fn elements_mut<'a>(
    parent: &'a mut Element,
    name: &'a str,
) -> impl Iterator<Item = &'a mut Element> + 'a {
    parent.children.iter_mut().filter_map(move |node| match node {
        XMLNode::Element(e) if e.name == name => Some(e),
        _ => None,
    })
}

fn attr<'a>(element: &'a Element, key: &str) -> Option<&'a str> {
    element.attributes.get(key).map(String::as_str)
}

fn set_attr(element: &mut Element, key: &str, value: &str) {
    element.attributes.insert(key.to_owned(), value.to_owned());
}

fn text_of(element: &Element) -> String {
    element
        .get_text()
        .map(|text| text.trim().to_owned())
        .unwrap_or_default()
}

fn set_text(element: &mut Element, text: &str) {
    element.children = vec![XMLNode::Text(text.to_owned())];
}

fn is_primary_disk(disk: &Element) -> bool {
    attr(disk, "device").map_or(true, |device| device == "disk")
}

fn is_qemu(element: &Element, name: &str) -> bool {
    element.name == name && element.namespace.as_deref() == Some(QEMU_NAMESPACE)
}

fn is_qemu_commandline(node: &XMLNode) -> bool {
    as_element(node).is_some_and(|e| is_qemu(e, "commandline"))
}

fn is_qemu_arg(node: &XMLNode) -> bool {
    as_element(node).is_some_and(|e| is_qemu(e, "arg"))
}

fn qemu_element(name: &str, prefix: Option<&str>) -> Element {
    let mut element = Element::new(name);
    element.prefix = prefix.map(str::to_owned);
    element.namespace = Some(QEMU_NAMESPACE.to_owned());
    element
}
