//! Domain descriptor rendering.
//!
//! A virtual machine definition is an XML document naming the instance, its
//! primary disk, and the full copy-on-write backing chain as nested
//! `backingStore` elements. The outermost backing element is the newest
//! ancestor artifact; the innermost is the oldest. The hypervisor needs the
//! whole chain spelled out because the per-image backing metadata alone is
//! not authoritative for a defined domain.

use std::path::{Path, PathBuf};

use crate::management::lineage::path_arg;
use crate::WindevResult;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// KVM domain skeleton. Placeholders are substituted at render time.
const DOMAIN_TEMPLATE: &str = r#"<domain type='kvm'>
  <name>__NAME__</name>
  <memory unit='GiB'>8</memory>
  <vcpu>4</vcpu>
  <os>
    <type arch='x86_64' machine='q35'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <cpu mode='host-passthrough'/>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='__PRIMARY_DISK__'/>
__BACKING_STORE__
      <target dev='vda' bus='virtio'/>
    </disk>
    <interface type='network'>
      <source network='default'/>
      <model type='virtio'/>
    </interface>
    <channel type='unix'>
      <target type='virtio' name='org.qemu.guest_agent.0'/>
    </channel>
    <graphics type='vnc' port='-1' autoport='yes' listen='127.0.0.1'/>
    <video>
      <model type='virtio'/>
    </video>
    <input type='tablet' bus='usb'/>
  </devices>
</domain>
"#;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A fully rendered virtual machine definition.
#[derive(Debug, Clone)]
pub struct VmDefinition {
    /// Instance name.
    pub name: String,

    /// Backing chain paths, newest ancestor first.
    pub disk_chain: Vec<PathBuf>,

    /// The rendered domain XML.
    pub descriptor_xml: String,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Renders the domain descriptor for an instance.
///
/// `primary_disk` is the writable top image; `chain` lists its ancestors
/// newest first. Each ancestor becomes one level of `backingStore` nesting,
/// so the outermost element in the document is the newest artifact.
pub fn render(name: &str, primary_disk: &Path, chain: &[PathBuf]) -> WindevResult<VmDefinition> {
    let backing = render_backing_store(chain, 0)?;
    let xml = DOMAIN_TEMPLATE
        .replace("__NAME__", &xml_escape(name))
        .replace("__PRIMARY_DISK__", &xml_escape(&path_arg(primary_disk)?))
        .replace("__BACKING_STORE__", backing.trim_end());

    Ok(VmDefinition {
        name: name.to_string(),
        disk_chain: chain.to_vec(),
        descriptor_xml: xml,
    })
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Renders `chain[depth..]` as nested backingStore elements.
fn render_backing_store(chain: &[PathBuf], depth: usize) -> WindevResult<String> {
    let Some(current) = chain.get(depth) else {
        return Ok(String::new());
    };

    let indent = "  ".repeat(depth + 3);
    let inner = render_backing_store(chain, depth + 1)?;
    Ok(format!(
        "{indent}<backingStore type='file'>\n\
         {indent}  <format type='qcow2'/>\n\
         {indent}  <source file='{}'/>\n\
         {inner}\
         {indent}</backingStore>\n",
        xml_escape(&path_arg(current)?),
    ))
}

/// Escapes the five XML special characters.
fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_nests_chain_newest_first() {
        let chain = vec![
            PathBuf::from("/images/newest.qcow2"),
            PathBuf::from("/images/middle.qcow2"),
            PathBuf::from("/images/oldest.qcow2"),
        ];
        let def = render("devbox", Path::new("/images/devbox.qcow2"), &chain).unwrap();

        assert_eq!(def.descriptor_xml.matches("<backingStore").count(), 3);

        // Document order follows chain order: the outermost element names
        // the newest ancestor.
        let newest = def.descriptor_xml.find("newest.qcow2").unwrap();
        let middle = def.descriptor_xml.find("middle.qcow2").unwrap();
        let oldest = def.descriptor_xml.find("oldest.qcow2").unwrap();
        assert!(newest < middle);
        assert!(middle < oldest);

        // The oldest element closes before the newest does.
        let first_close = def.descriptor_xml.find("</backingStore>").unwrap();
        assert!(oldest < first_close);
    }

    #[test]
    fn test_render_without_ancestors_has_no_backing_store() {
        let def = render("devbox", Path::new("/images/devbox.qcow2"), &[]).unwrap();
        assert!(!def.descriptor_xml.contains("<backingStore"));
        assert!(def.descriptor_xml.contains("<source file='/images/devbox.qcow2'/>"));
    }

    #[test]
    fn test_render_escapes_name_and_paths() {
        let chain = vec![PathBuf::from("/images/a&b.qcow2")];
        let def = render("dev<box>", Path::new("/images/top.qcow2"), &chain).unwrap();
        assert!(def.descriptor_xml.contains("<name>dev&lt;box&gt;</name>"));
        assert!(def.descriptor_xml.contains("a&amp;b.qcow2"));
    }

    #[test]
    fn test_descriptor_carries_guest_agent_channel() {
        let def = render("devbox", Path::new("/images/devbox.qcow2"), &[]).unwrap();
        assert!(def.descriptor_xml.contains("org.qemu.guest_agent.0"));
    }
}
