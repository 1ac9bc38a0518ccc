//! SOAP envelopes for IGD control actions.

use anyhow::{anyhow, Context, Result};
use xmltree::Element;

const ENVELOPE_HEAD: &str = r#"<?xml version="1.0"?>
<s:Envelope s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/" xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
<s:Body>"#;

const ENVELOPE_TAIL: &str = "</s:Body>\n</s:Envelope>";

/// A gateway-reported SOAP fault, as numeric code plus description.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("gateway error {code}: {message}")]
pub struct UpnpError {
    /// The `errorCode` reported by the gateway.
    pub code: u16,
    /// The `errorDescription` reported by the gateway.
    pub message: String,
}

fn xml_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Builds the envelope for `action`. Argument order is significant and must
/// follow the IGD specification for the action.
pub(crate) fn envelope(service_type: &str, action: &str, args: &[(&str, String)]) -> String {
    let mut body = String::new();
    body.push_str(&format!("<u:{action} xmlns:u=\"{service_type}\">"));
    for (name, value) in args {
        body.push_str(&format!("<{name}>{}</{name}>", xml_escape(value)));
    }
    body.push_str(&format!("</u:{action}>"));
    format!("{ENVELOPE_HEAD}\n{body}\n{ENVELOPE_TAIL}")
}

/// The `SOAPACTION` header value for `action`.
pub(crate) fn action_header(service_type: &str, action: &str) -> String {
    format!("\"{service_type}#{action}\"")
}

/// Depth-first search by local element name, which makes the lookup immune
/// to whatever namespace prefix the gateway chose.
fn find_by_name<'a>(element: &'a Element, name: &str) -> Option<&'a Element> {
    if element.name == name {
        return Some(element);
    }
    element
        .children
        .iter()
        .filter_map(|node| node.as_element())
        .find_map(|child| find_by_name(child, name))
}

/// Text content of a direct child element.
pub(crate) fn child_text(element: &Element, name: &str) -> Option<String> {
    element
        .get_child(name)
        .and_then(|child| child.get_text())
        .map(|text| text.trim().to_string())
}

fn fault_error(fault: &Element) -> anyhow::Error {
    if let Some(upnp_error) = find_by_name(fault, "UPnPError") {
        let code = child_text(upnp_error, "errorCode")
            .and_then(|code| code.parse().ok())
            .unwrap_or_default();
        let message = child_text(upnp_error, "errorDescription")
            .unwrap_or_else(|| "unspecified UPnP error".to_string());
        return UpnpError { code, message }.into();
    }
    let fault_string =
        child_text(fault, "faultstring").unwrap_or_else(|| "unspecified fault".to_string());
    anyhow!("SOAP fault: {fault_string}")
}

/// Parses a SOAP response body, locating the `<action>Response` element.
///
/// A fault body surfaces as an error, carrying the gateway's numeric code
/// and message when present.
pub(crate) fn parse_response(body: &str, action: &str) -> Result<Element> {
    let root = Element::parse(body.as_bytes()).context("invalid SOAP response document")?;
    if let Some(fault) = find_by_name(&root, "Fault") {
        return Err(fault_error(fault));
    }
    let key = format!("{action}Response");
    find_by_name(&root, &key)
        .cloned()
        .ok_or_else(|| anyhow!("missing {key} in SOAP response"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const WANIP_2: &str = "urn:schemas-upnp-org:service:WANIPConnection:2";

    #[test]
    fn envelope_keeps_argument_order() {
        let body = envelope(
            WANIP_2,
            "AddAnyPortMapping",
            &[
                ("NewRemoteHost", String::new()),
                ("NewExternalPort", "5000".to_string()),
                ("NewProtocol", "TCP".to_string()),
            ],
        );
        let expected = "<u:AddAnyPortMapping xmlns:u=\"urn:schemas-upnp-org:service:WANIPConnection:2\">\
            <NewRemoteHost></NewRemoteHost>\
            <NewExternalPort>5000</NewExternalPort>\
            <NewProtocol>TCP</NewProtocol>\
            </u:AddAnyPortMapping>";
        assert!(body.contains(expected), "unexpected body: {body}");
        assert!(body.starts_with("<?xml version=\"1.0\"?>"));
    }

    #[test]
    fn envelope_escapes_values() {
        let body = envelope(
            WANIP_2,
            "AddPortMapping",
            &[("NewPortMappingDescription", "a <b> & c".to_string())],
        );
        assert!(body.contains("<NewPortMappingDescription>a &lt;b&gt; &amp; c</NewPortMappingDescription>"));
    }

    #[test]
    fn action_header_is_quoted() {
        assert_eq!(
            action_header(WANIP_2, "GetExternalIPAddress"),
            "\"urn:schemas-upnp-org:service:WANIPConnection:2#GetExternalIPAddress\""
        );
    }

    #[test]
    fn parse_response_tolerates_namespace_prefixes() {
        let body = r#"<?xml version="1.0"?>
            <SOAP-ENV:Envelope xmlns:SOAP-ENV="http://schemas.xmlsoap.org/soap/envelope/">
              <SOAP-ENV:Body>
                <m:AddAnyPortMappingResponse xmlns:m="urn:schemas-upnp-org:service:WANIPConnection:2">
                  <NewReservedPort>50123</NewReservedPort>
                </m:AddAnyPortMappingResponse>
              </SOAP-ENV:Body>
            </SOAP-ENV:Envelope>"#;
        let response = parse_response(body, "AddAnyPortMapping").unwrap();
        assert_eq!(child_text(&response, "NewReservedPort").as_deref(), Some("50123"));
    }

    #[test]
    fn parse_response_surfaces_upnp_faults() {
        let body = r#"<?xml version="1.0"?>
            <s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
              <s:Body>
                <s:Fault>
                  <faultcode>s:Client</faultcode>
                  <faultstring>UPnPError</faultstring>
                  <detail>
                    <UPnPError xmlns="urn:schemas-upnp-org:control-1-0">
                      <errorCode>718</errorCode>
                      <errorDescription>ConflictInMappingEntry</errorDescription>
                    </UPnPError>
                  </detail>
                </s:Fault>
              </s:Body>
            </s:Envelope>"#;
        let err = parse_response(body, "AddPortMapping").unwrap_err();
        let fault = err.downcast_ref::<UpnpError>().expect("typed fault");
        assert_eq!(fault.code, 718);
        assert_eq!(fault.message, "ConflictInMappingEntry");
    }

    #[test]
    fn parse_response_requires_the_matching_key() {
        let body = r#"<?xml version="1.0"?>
            <s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
              <s:Body>
                <u:DeletePortMappingResponse xmlns:u="urn:schemas-upnp-org:service:WANIPConnection:2"/>
              </s:Body>
            </s:Envelope>"#;
        assert!(parse_response(body, "DeletePortMapping").is_ok());
        assert!(parse_response(body, "AddPortMapping").is_err());
    }
}
