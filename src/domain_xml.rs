use crate::gateway::DomainSpec;

/// Generate libvirt domain XML for an instance.
pub fn generate_domain_xml(spec: &DomainSpec) -> String {
    let name = escape(&spec.name);
    let memory_mib = spec.memory_mb;
    let cpus = spec.vcpus;
    let domain_type = escape(&spec.domain_type);
    let machine = escape(&spec.machine);
    let network = escape(&spec.network);
    let driver = spec.disk_format.driver();
    let disk = escape(&spec.disk.display().to_string());

    format!(
        r#"<domain type='{domain_type}'>
  <name>{name}</name>
  <memory unit='MiB'>{memory_mib}</memory>
  <vcpu>{cpus}</vcpu>
  <os>
    <type arch='x86_64' machine='{machine}'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='{driver}'/>
      <source file='{disk}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <interface type='network'>
      <source network='{network}'/>
      <model type='virtio'/>
    </interface>
    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
  </devices>
</domain>
"#
    )
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::DiskFormat;

    fn spec() -> DomainSpec {
        DomainSpec {
            name: "test-vm".into(),
            memory_mb: 2048,
            vcpus: 2,
            disk: "/opt/mockmox/active/test-vm.qcow2".into(),
            disk_format: DiskFormat::Qcow2,
            domain_type: "kvm".into(),
            machine: "q35".into(),
            network: "default".into(),
        }
    }

    #[test]
    fn xml_contains_vm_name() {
        let xml = generate_domain_xml(&spec());
        assert!(xml.contains("<name>test-vm</name>"));
    }

    #[test]
    fn xml_contains_resources() {
        let xml = generate_domain_xml(&spec());
        assert!(xml.contains("<memory unit='MiB'>2048</memory>"));
        assert!(xml.contains("<vcpu>2</vcpu>"));
    }

    #[test]
    fn oversized_memory_is_passed_through_unscaled() {
        let mut spec = spec();
        spec.memory_mb = u64::MAX;
        let xml = generate_domain_xml(&spec);
        assert!(xml.contains(&format!("<memory unit='MiB'>{}</memory>", u64::MAX)));
    }

    #[test]
    fn xml_contains_disk_and_network() {
        let xml = generate_domain_xml(&spec());
        assert!(xml.contains("<driver name='qemu' type='qcow2'/>"));
        assert!(xml.contains("<source file='/opt/mockmox/active/test-vm.qcow2'/>"));
        assert!(xml.contains("<source network='default'/>"));
        assert!(xml.contains("type='kvm'"));
        assert!(xml.contains("machine='q35'"));
    }

    #[test]
    fn raw_disks_use_raw_driver() {
        let mut spec = spec();
        spec.disk = "/opt/mockmox/active/test-vm.img".into();
        spec.disk_format = DiskFormat::Raw;
        let xml = generate_domain_xml(&spec);
        assert!(xml.contains("<driver name='qemu' type='raw'/>"));
    }

    #[test]
    fn attribute_values_are_escaped() {
        let mut spec = spec();
        spec.disk = "/srv/it's here/a.qcow2".into();
        let xml = generate_domain_xml(&spec);
        assert!(xml.contains("/srv/it&apos;s here/a.qcow2"));
    }
}
