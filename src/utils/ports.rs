use anyhow::Result;
use serialport::SerialPortType;
use std::path::Path;

/// Return a sorted list of available ports as (port_name, port_type_string).
pub fn enumerate_ports() -> Result<Vec<(String, String)>> {
    let mut ports = serialport::available_ports()?;
    ports.sort_by(|a, b| a.port_name.cmp(&b.port_name));
    Ok(ports
        .into_iter()
        .map(|p| (p.port_name, describe_port_type(&p.port_type)))
        .collect())
}

fn describe_port_type(port_type: &SerialPortType) -> String {
    match port_type {
        SerialPortType::UsbPort(info) => {
            let mut label = format!("USB {:04x}:{:04x}", info.vid, info.pid);
            if let Some(product) = &info.product {
                label.push(' ');
                label.push_str(product);
            }
            label
        }
        SerialPortType::PciPort => "PCI".to_string(),
        SerialPortType::BluetoothPort => "Bluetooth".to_string(),
        SerialPortType::Unknown => "Unknown".to_string(),
    }
}

/// Ports from `ports` that do not exist as device nodes on this host.
///
/// Only meaningful for path-like names; anything else (e.g. `COM3`) is
/// assumed present.
pub fn missing_ports(ports: &[String]) -> Vec<String> {
    ports
        .iter()
        .filter(|port| port.starts_with('/') && !Path::new(port.as_str()).exists())
        .cloned()
        .collect()
}
