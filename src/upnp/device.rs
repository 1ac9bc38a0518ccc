//! UPnP device descriptors.

use anyhow::{anyhow, Context, Result};
use url::Url;
use xmltree::Element;

use super::soap::child_text;

pub(crate) const WAN_IP_CONNECTION_2: &str = "urn:schemas-upnp-org:service:WANIPConnection:2";
pub(crate) const WAN_IP_CONNECTION_1: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";
pub(crate) const WAN_IPV6_FIREWALL_CONTROL: &str =
    "urn:schemas-upnp-org:service:WANIPv6FirewallControl:1";

/// A service entry of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Service type URN, e.g. `urn:schemas-upnp-org:service:WANIPConnection:2`.
    pub service_type: String,
    /// Service identifier.
    pub service_id: String,
    /// Control URL, possibly relative to the descriptor's base URL.
    pub control_url: String,
    /// Service description URL, possibly relative.
    pub scpd_url: String,
}

/// A device node of the descriptor tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Device type URN.
    pub device_type: String,
    /// Human readable name.
    pub friendly_name: String,
    /// Unique device name.
    pub udn: String,
    /// Services of this device.
    pub services: Vec<ServiceInfo>,
    /// Embedded devices.
    pub devices: Vec<Device>,
}

impl Device {
    fn parse(element: &Element) -> Device {
        let services = element
            .get_child("serviceList")
            .map(|list| {
                list.children
                    .iter()
                    .filter_map(|node| node.as_element())
                    .filter(|child| child.name == "service")
                    .map(|service| ServiceInfo {
                        service_type: child_text(service, "serviceType").unwrap_or_default(),
                        service_id: child_text(service, "serviceId").unwrap_or_default(),
                        control_url: child_text(service, "controlURL").unwrap_or_default(),
                        scpd_url: child_text(service, "SCPDURL").unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let devices = element
            .get_child("deviceList")
            .map(|list| {
                list.children
                    .iter()
                    .filter_map(|node| node.as_element())
                    .filter(|child| child.name == "device")
                    .map(Device::parse)
                    .collect()
            })
            .unwrap_or_default();
        Device {
            device_type: child_text(element, "deviceType").unwrap_or_default(),
            friendly_name: child_text(element, "friendlyName").unwrap_or_default(),
            udn: child_text(element, "UDN").unwrap_or_default(),
            services,
            devices,
        }
    }

    /// Depth-first search for the first service of one of the given types.
    pub(crate) fn find_service(&self, service_types: &[&str]) -> Option<&ServiceInfo> {
        for wanted in service_types {
            if let Some(service) = self.find_service_inner(wanted) {
                return Some(service);
            }
        }
        None
    }

    fn find_service_inner(&self, wanted: &str) -> Option<&ServiceInfo> {
        if let Some(service) = self
            .services
            .iter()
            .find(|service| service.service_type == wanted)
        {
            return Some(service);
        }
        self.devices
            .iter()
            .find_map(|device| device.find_service_inner(wanted))
    }
}

/// A parsed device descriptor, with the URL context needed to reach its
/// services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Where the descriptor was fetched from.
    pub location: Url,
    /// Base for relative URLs in the descriptor.
    pub base_url: Url,
    /// The root device.
    pub root: Device,
}

impl DeviceDescriptor {
    /// Parses a descriptor document as served at `location`.
    ///
    /// Relative control URLs resolve against the `URLBase` element when
    /// present, the descriptor location otherwise.
    pub fn parse(xml: &str, location: Url) -> Result<Self> {
        let root = Element::parse(xml.as_bytes()).context("invalid descriptor document")?;
        let base_url = match root.get_child("URLBase").and_then(|e| e.get_text()) {
            Some(base) => Url::parse(base.trim()).context("invalid URLBase in descriptor")?,
            None => location.clone(),
        };
        let device = root
            .get_child("device")
            .ok_or_else(|| anyhow!("descriptor has no root device"))?;
        Ok(DeviceDescriptor {
            location,
            base_url,
            root: Device::parse(device),
        })
    }

    /// Absolute control URL of a service of this descriptor.
    pub(crate) fn control_url(&self, service: &ServiceInfo) -> Result<Url> {
        self.base_url
            .join(&service.control_url)
            .with_context(|| format!("invalid control URL {:?}", service.control_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTOR: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <device>
    <deviceType>urn:schemas-upnp-org:device:InternetGatewayDevice:2</deviceType>
    <friendlyName>Test Router</friendlyName>
    <UDN>uuid:11111111-2222-3333-4444-555555555555</UDN>
    <deviceList>
      <device>
        <deviceType>urn:schemas-upnp-org:device:WANDevice:2</deviceType>
        <friendlyName>WANDevice</friendlyName>
        <UDN>uuid:11111111-2222-3333-4444-666666666666</UDN>
        <deviceList>
          <device>
            <deviceType>urn:schemas-upnp-org:device:WANConnectionDevice:2</deviceType>
            <friendlyName>WANConnectionDevice</friendlyName>
            <UDN>uuid:11111111-2222-3333-4444-777777777777</UDN>
            <serviceList>
              <service>
                <serviceType>urn:schemas-upnp-org:service:WANIPConnection:2</serviceType>
                <serviceId>urn:upnp-org:serviceId:WANIPConn1</serviceId>
                <controlURL>/ctl/IPConn</controlURL>
                <SCPDURL>/WANIPCn.xml</SCPDURL>
              </service>
            </serviceList>
          </device>
        </deviceList>
      </device>
    </deviceList>
  </device>
</root>"#;

    #[test]
    fn parses_nested_devices_and_finds_the_wan_service() {
        let location: Url = "http://192.168.1.1:5000/rootDesc.xml".parse().unwrap();
        let descriptor = DeviceDescriptor::parse(DESCRIPTOR, location).unwrap();
        assert_eq!(descriptor.root.friendly_name, "Test Router");

        let service = descriptor
            .root
            .find_service(&[WAN_IP_CONNECTION_2, WAN_IP_CONNECTION_1])
            .expect("service present");
        assert_eq!(service.service_type, WAN_IP_CONNECTION_2);
        assert_eq!(service.scpd_url, "/WANIPCn.xml");

        // relative control URLs resolve against the descriptor location
        let control = descriptor.control_url(service).unwrap();
        assert_eq!(control.as_str(), "http://192.168.1.1:5000/ctl/IPConn");
    }

    #[test]
    fn url_base_wins_over_the_location() {
        let with_base = DESCRIPTOR.replacen(
            "<specVersion>",
            "<URLBase>http://10.0.0.1:49000/</URLBase><specVersion>",
            1,
        );
        let location: Url = "http://192.168.1.1:5000/rootDesc.xml".parse().unwrap();
        let descriptor = DeviceDescriptor::parse(&with_base, location).unwrap();
        let service = descriptor
            .root
            .find_service(&[WAN_IP_CONNECTION_2])
            .unwrap();
        let control = descriptor.control_url(service).unwrap();
        assert_eq!(control.as_str(), "http://10.0.0.1:49000/ctl/IPConn");
    }

    #[test]
    fn missing_device_is_an_error() {
        let location: Url = "http://192.168.1.1:5000/rootDesc.xml".parse().unwrap();
        assert!(DeviceDescriptor::parse("<root></root>", location).is_err());
    }
}
