//! libvirt domain XML inspection
//!
//! Only the pieces the console needs are extracted: the runtime id of the
//! domain (libvirt writes `id='N'` on the root element while the domain is
//! active) and the VNC graphics stanza.

use std::sync::OnceLock;

use regex_lite::Regex;

use crate::error::{Error, Result};
use crate::types::{DisplayConfig, DisplayPort};

/// Display-relevant facts from a domain definition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainInfo {
    pub id: Option<u32>,
    pub display: Option<DisplayConfig>,
}

fn compiled(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Result<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok())
        .as_ref()
        .ok_or_else(|| Error::Internal(format!("bad pattern {}", pattern)))
}

fn domain_tag() -> Result<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, r"<domain\b[^>]*>")
}

fn graphics_tag() -> Result<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, r"<graphics\b[^>]*>")
}

fn attribute() -> Result<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(
        &RE,
        r#"([A-Za-z_:][-A-Za-z0-9_:.]*)\s*=\s*(?:'([^']*)'|"([^"]*)")"#,
    )
}

/// Look up an attribute value inside a single start tag
fn attr<'a>(attribute: &Regex, tag: &'a str, name: &str) -> Option<&'a str> {
    attribute.captures_iter(tag).find_map(|caps| {
        if caps.get(1)?.as_str() != name {
            return None;
        }
        caps.get(2).or_else(|| caps.get(3)).map(|m| m.as_str())
    })
}

/// Parse the display-relevant parts of a domain XML document
pub fn parse_domain_xml(xml: &str) -> Result<DomainInfo> {
    let attribute = attribute()?;
    let root = domain_tag()?
        .find(xml)
        .ok_or_else(|| Error::DomainXml("missing <domain> element".to_string()))?;

    let id = match attr(attribute, root.as_str(), "id") {
        Some(raw) => Some(
            raw.parse::<u32>()
                .map_err(|_| Error::DomainXml(format!("invalid domain id '{}'", raw)))?,
        ),
        None => None,
    };

    let display = graphics_tag()?
        .find_iter(xml)
        .map(|m| m.as_str())
        .find(|tag| attr(attribute, tag, "type") == Some("vnc"))
        .map(|tag| parse_vnc_graphics(attribute, tag))
        .transpose()?;

    Ok(DomainInfo { id, display })
}

fn parse_vnc_graphics(attribute: &Regex, tag: &str) -> Result<DisplayConfig> {
    let port = match attr(attribute, tag, "port") {
        Some(raw) => {
            let value = raw
                .parse::<i32>()
                .map_err(|_| Error::DomainXml(format!("invalid vnc port '{}'", raw)))?;
            DisplayPort::from_raw(value)
                .ok_or_else(|| Error::DomainXml(format!("vnc port out of range: {}", value)))?
        }
        // autoport='yes' without a port is how an inactive definition looks
        None if attr(attribute, tag, "autoport") == Some("yes") => DisplayPort::Auto,
        None => return Err(Error::DomainXml("vnc graphics without port".to_string())),
    };
    Ok(DisplayConfig { port })
}

#[cfg(test)]
mod tests {
    use super::*;

    const INACTIVE: &str = r#"<domain type='kvm'>
  <name>alpha</name>
  <devices>
    <graphics type='vnc' port='-1' autoport='yes'/>
  </devices>
</domain>"#;

    const ACTIVE: &str = r#"<domain type='kvm' id='7'>
  <name>alpha</name>
  <devices>
    <graphics type='spice' port='5930' autoport='yes'/>
    <graphics type="vnc" port="5907" autoport="yes" listen="127.0.0.1">
      <listen type='address' address='127.0.0.1'/>
    </graphics>
  </devices>
</domain>"#;

    #[test]
    fn test_inactive_auto_port() {
        let info = parse_domain_xml(INACTIVE).unwrap();
        assert_eq!(info.id, None);
        assert_eq!(info.display, Some(DisplayConfig { port: DisplayPort::Auto }));
    }

    #[test]
    fn test_active_domain_skips_spice() {
        let info = parse_domain_xml(ACTIVE).unwrap();
        assert_eq!(info.id, Some(7));
        assert_eq!(
            info.display,
            Some(DisplayConfig {
                port: DisplayPort::Fixed(5907)
            })
        );
    }

    #[test]
    fn test_no_graphics() {
        let xml = "<domain type='kvm'><name>beta</name><devices/></domain>";
        let info = parse_domain_xml(xml).unwrap();
        assert_eq!(info.display, None);
    }

    #[test]
    fn test_autoport_without_port() {
        let xml = "<domain type='kvm'><graphics type='vnc' autoport='yes'/></domain>";
        let info = parse_domain_xml(xml).unwrap();
        assert_eq!(info.display.map(|d| d.port), Some(DisplayPort::Auto));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(parse_domain_xml("not xml").is_err());
        assert!(parse_domain_xml("<domain><graphics type='vnc' port='abc'/></domain>").is_err());
    }

    #[test]
    fn test_bad_pattern_is_internal_error() {
        static BROKEN: OnceLock<Option<Regex>> = OnceLock::new();
        let err = compiled(&BROKEN, r"<graphics(").unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        // The failure is remembered, not retried
        assert!(compiled(&BROKEN, r"<graphics\b").is_err());
    }
}
