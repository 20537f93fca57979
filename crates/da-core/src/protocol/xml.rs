//! Generic V6 XML message handling.
//!
//! V6 payloads are small XML documents rooted at `da`, with `version`,
//! `command` and an `arg` element whose children vary per command. The
//! argument set is open-ended, so serialization is mapping-based (an
//! ordered list of named fields) rather than one fixed schema per command,
//! and parsing looks fields up by path.

use std::str::FromStr;

use crate::error::{DaError, Result};

/// One V6 XML message, host- or device-originated.
#[derive(Debug, Clone)]
pub struct XmlMessage {
    pub version: String,
    pub command: String,
    /// Ordered argument fields, used when serializing.
    pub args: Vec<(String, String)>,
    /// Free-text detail on `CMD:END`, absent on success.
    pub message: Option<String>,
    raw: String,
}

impl XmlMessage {
    pub fn new(command: &str) -> Self {
        Self {
            version: "1.0".to_string(),
            command: command.to_string(),
            args: Vec::new(),
            message: None,
            raw: String::new(),
        }
    }

    /// Append a named argument field.
    pub fn arg<V: ToString>(mut self, name: &str, value: V) -> Self {
        self.args.push((name.to_string(), value.to_string()));
        self
    }

    /// Serialize to the wire form.
    pub fn to_xml(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><da>");
        out.push_str(&format!("<version>{}</version>", self.version));
        out.push_str(&format!("<command>{}</command>", self.command));
        out.push_str("<arg>");
        for (name, value) in &self.args {
            out.push_str(&format!("<{}>{}</{}>", name, value, name));
        }
        out.push_str("</arg></da>");
        out
    }

    /// Parse a device message, extracting the envelope fields. Arguments
    /// stay in the raw document and are read by path via [`Self::field`].
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| DaError::xml("message is not valid UTF-8"))?
            .trim_end_matches('\0')
            .to_string();

        let version = get_tag(&text, "version").unwrap_or_else(|_| String::new());
        let command: String = get_tag(&text, "command")?;
        let message: Option<String> = get_tag(&text, "arg/message").ok();

        Ok(Self {
            version,
            command,
            args: Vec::new(),
            message,
            raw: text,
        })
    }

    /// Look up an argument field of a parsed message by path under `da`.
    pub fn field<T: FromStr>(&self, path: &str) -> Result<T> {
        get_tag(&self.raw, path)
    }

    /// Look up a `0x`-prefixed hex argument field.
    pub fn field_hex(&self, path: &str) -> Result<u64> {
        let raw: String = self.field(path)?;
        let trimmed = raw.trim().trim_start_matches("0x");
        u64::from_str_radix(trimmed, 16)
            .map_err(|_| DaError::xml(format!("field `{}` is not a hex value", path)))
    }
}

/// Fetch the content of the tag at `path` (relative to the root element)
/// and parse it.
pub fn get_tag<T>(xml: &str, path: &str) -> Result<T>
where
    T: FromStr,
{
    let root =
        simple_xml::from_string(xml).map_err(|_| DaError::xml("failed to parse document"))?;

    let mut node = &root;
    for part in path.split('/') {
        let nodes = node
            .get_nodes(part)
            .ok_or_else(|| DaError::xml(format!("tag `{}` not found", part)))?;
        if nodes.is_empty() {
            return Err(DaError::xml(format!("tag `{}` empty", part)));
        }
        node = &nodes[0];
    }

    node.content
        .trim()
        .parse::<T>()
        .map_err(|_| DaError::xml(format!("failed to parse tag `{}`", path)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_shape() {
        let msg = XmlMessage::new("CMD:READ-PARTITION")
            .arg("partition", "boot_a")
            .arg("target_file", "boot_a.img");
        let xml = msg.to_xml();
        assert!(xml.contains("<command>CMD:READ-PARTITION</command>"));
        assert!(xml.contains("<arg><partition>boot_a</partition><target_file>boot_a.img</target_file></arg>"));
    }

    #[test]
    fn test_parse_envelope_and_fields() {
        let raw = b"<?xml version=\"1.0\"?><da><version>1.0</version>\
                    <command>CMD:RAM-REQUEST</command>\
                    <arg><length>0x1000</length></arg></da>\0";
        let msg = XmlMessage::parse(raw).unwrap();
        assert_eq!(msg.command, "CMD:RAM-REQUEST");
        assert_eq!(msg.version, "1.0");
        assert!(msg.message.is_none());
        assert_eq!(msg.field_hex("arg/length").unwrap(), 0x1000);
    }

    #[test]
    fn test_parse_end_with_message() {
        let raw = b"<da><version>1.0</version><command>CMD:END</command>\
                    <arg><message>partition not found</message></arg></da>";
        let msg = XmlMessage::parse(raw).unwrap();
        assert_eq!(msg.command, "CMD:END");
        assert_eq!(msg.message.as_deref(), Some("partition not found"));
    }

    #[test]
    fn test_roundtrip_through_parser() {
        let xml = XmlMessage::new("CMD:WRITE-PARTITION")
            .arg("partition", "seccfg")
            .to_xml();
        let parsed = XmlMessage::parse(xml.as_bytes()).unwrap();
        assert_eq!(parsed.command, "CMD:WRITE-PARTITION");
        let partition: String = parsed.field("arg/partition").unwrap();
        assert_eq!(partition, "seccfg");
    }

    #[test]
    fn test_malformed_is_xml_error() {
        let err = XmlMessage::parse(b"<da><version>").unwrap_err();
        assert!(matches!(err, DaError::Xml(_)));
    }
}
