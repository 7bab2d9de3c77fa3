//! Minimal XML-RPC codec covering the subset of the protocol the XenAPI
//! speaks: scalar values, `dateTime.iso8601`, arrays and structs.

use std::collections::BTreeMap;
use std::io::Write;

use thiserror::Error;
use xml::reader::{EventReader, XmlEvent as ReaderEvent};
use xml::writer::{EmitterConfig, EventWriter, XmlEvent as WriterEvent};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("malformed xml-rpc document: {0}")]
    Xml(#[from] xml::reader::Error),
    #[error("failed to emit xml-rpc document: {0}")]
    Emit(#[from] xml::writer::Error),
    #[error("unexpected xml-rpc structure: {0}")]
    Unexpected(String),
    #[error("xml-rpc fault {code}: {message}")]
    Fault { code: i64, message: String },
}

/// A decoded XML-RPC value. `DateTime` keeps the wire text verbatim so
/// hypervisor timestamps survive a backup/restore round trip untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcValue {
    Int(i64),
    Bool(bool),
    Str(String),
    Double(f64),
    DateTime(String),
    Array(Vec<RpcValue>),
    Struct(BTreeMap<String, RpcValue>),
}

impl RpcValue {
    pub fn string(s: impl Into<String>) -> RpcValue {
        RpcValue::Str(s.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RpcValue::Str(s) | RpcValue::DateTime(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RpcValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<RpcValue>> {
        match self {
            RpcValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_struct(self) -> Option<BTreeMap<String, RpcValue>> {
        match self {
            RpcValue::Struct(members) => Some(members),
            _ => None,
        }
    }

    /// Convert into a JSON value, preserving every field. Struct order is
    /// kept stable by the underlying map so definition files diff cleanly.
    pub fn into_json(self) -> serde_json::Value {
        match self {
            RpcValue::Int(i) => serde_json::Value::from(i),
            RpcValue::Bool(b) => serde_json::Value::from(b),
            RpcValue::Str(s) => serde_json::Value::from(s),
            RpcValue::Double(d) => serde_json::Value::from(d),
            RpcValue::DateTime(s) => serde_json::Value::from(s),
            RpcValue::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(RpcValue::into_json).collect())
            }
            RpcValue::Struct(members) => serde_json::Value::Object(
                members
                    .into_iter()
                    .map(|(k, v)| (k, v.into_json()))
                    .collect(),
            ),
        }
    }

    /// Inverse of [`into_json`]: used when re-creating objects from a
    /// persisted definition file. JSON nulls become empty strings, which
    /// is how the XenAPI spells absence in record fields.
    pub fn from_json(value: serde_json::Value) -> RpcValue {
        match value {
            serde_json::Value::Null => RpcValue::Str(String::new()),
            serde_json::Value::Bool(b) => RpcValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    RpcValue::Int(i)
                } else {
                    RpcValue::Double(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => RpcValue::Str(s),
            serde_json::Value::Array(items) => {
                RpcValue::Array(items.into_iter().map(RpcValue::from_json).collect())
            }
            serde_json::Value::Object(members) => RpcValue::Struct(
                members
                    .into_iter()
                    .map(|(k, v)| (k, RpcValue::from_json(v)))
                    .collect(),
            ),
        }
    }
}

/// Encode a `<methodCall>` document.
pub fn encode_call(method: &str, params: &[RpcValue]) -> Result<String, RpcError> {
    let mut out: Vec<u8> = Vec::new();
    let mut writer = EmitterConfig::new()
        .write_document_declaration(true)
        .create_writer(&mut out);

    writer.write(WriterEvent::start_element("methodCall"))?;
    writer.write(WriterEvent::start_element("methodName"))?;
    writer.write(WriterEvent::characters(method))?;
    writer.write(WriterEvent::end_element())?;
    writer.write(WriterEvent::start_element("params"))?;
    for param in params {
        writer.write(WriterEvent::start_element("param"))?;
        write_value(&mut writer, param)?;
        writer.write(WriterEvent::end_element())?;
    }
    writer.write(WriterEvent::end_element())?;
    writer.write(WriterEvent::end_element())?;

    Ok(String::from_utf8(out).unwrap_or_default())
}

fn write_value<W: Write>(writer: &mut EventWriter<W>, value: &RpcValue) -> Result<(), RpcError> {
    writer.write(WriterEvent::start_element("value"))?;
    match value {
        RpcValue::Int(i) => write_scalar(writer, "int", &i.to_string())?,
        RpcValue::Bool(b) => write_scalar(writer, "boolean", if *b { "1" } else { "0" })?,
        RpcValue::Str(s) => write_scalar(writer, "string", s)?,
        RpcValue::Double(d) => write_scalar(writer, "double", &d.to_string())?,
        RpcValue::DateTime(s) => write_scalar(writer, "dateTime.iso8601", s)?,
        RpcValue::Array(items) => {
            writer.write(WriterEvent::start_element("array"))?;
            writer.write(WriterEvent::start_element("data"))?;
            for item in items {
                write_value(writer, item)?;
            }
            writer.write(WriterEvent::end_element())?;
            writer.write(WriterEvent::end_element())?;
        }
        RpcValue::Struct(members) => {
            writer.write(WriterEvent::start_element("struct"))?;
            for (name, member) in members {
                writer.write(WriterEvent::start_element("member"))?;
                writer.write(WriterEvent::start_element("name"))?;
                writer.write(WriterEvent::characters(name))?;
                writer.write(WriterEvent::end_element())?;
                write_value(writer, member)?;
                writer.write(WriterEvent::end_element())?;
            }
            writer.write(WriterEvent::end_element())?;
        }
    }
    writer.write(WriterEvent::end_element())?;
    Ok(())
}

fn write_scalar<W: Write>(
    writer: &mut EventWriter<W>,
    tag: &str,
    text: &str,
) -> Result<(), RpcError> {
    writer.write(WriterEvent::start_element(tag))?;
    if !text.is_empty() {
        writer.write(WriterEvent::characters(text))?;
    }
    writer.write(WriterEvent::end_element())?;
    Ok(())
}

/// Decode a `<methodResponse>` document, turning `<fault>` into
/// [`RpcError::Fault`].
pub fn parse_response(body: &str) -> Result<RpcValue, RpcError> {
    let mut reader = EventReader::from_str(body);

    match next_significant(&mut reader)? {
        ReaderEvent::StartElement { name, .. } if name.local_name == "methodResponse" => {}
        other => {
            return Err(RpcError::Unexpected(format!(
                "expected <methodResponse>, got {:?}",
                other
            )))
        }
    }

    match next_significant(&mut reader)? {
        ReaderEvent::StartElement { name, .. } if name.local_name == "params" => {
            expect_start(&mut reader, "param")?;
            expect_start(&mut reader, "value")?;
            let value = parse_value(&mut reader)?;
            Ok(value)
        }
        ReaderEvent::StartElement { name, .. } if name.local_name == "fault" => {
            expect_start(&mut reader, "value")?;
            let fault = parse_value(&mut reader)?;
            let members = fault
                .into_struct()
                .ok_or_else(|| RpcError::Unexpected("fault without struct body".into()))?;
            let code = match members.get("faultCode") {
                Some(RpcValue::Int(i)) => *i,
                _ => 0,
            };
            let message = members
                .get("faultString")
                .and_then(RpcValue::as_str)
                .unwrap_or_default()
                .to_string();
            Err(RpcError::Fault { code, message })
        }
        other => Err(RpcError::Unexpected(format!(
            "expected <params> or <fault>, got {:?}",
            other
        ))),
    }
}

fn next_significant<R: std::io::Read>(
    reader: &mut EventReader<R>,
) -> Result<ReaderEvent, RpcError> {
    loop {
        match reader.next()? {
            ReaderEvent::StartDocument { .. }
            | ReaderEvent::Whitespace(_)
            | ReaderEvent::Comment(_)
            | ReaderEvent::ProcessingInstruction { .. } => continue,
            event => return Ok(event),
        }
    }
}

fn expect_start<R: std::io::Read>(
    reader: &mut EventReader<R>,
    tag: &str,
) -> Result<(), RpcError> {
    match next_significant(reader)? {
        ReaderEvent::StartElement { name, .. } if name.local_name == tag => Ok(()),
        other => Err(RpcError::Unexpected(format!(
            "expected <{}>, got {:?}",
            tag, other
        ))),
    }
}

fn expect_end<R: std::io::Read>(reader: &mut EventReader<R>, tag: &str) -> Result<(), RpcError> {
    match next_significant(reader)? {
        ReaderEvent::EndElement { name } if name.local_name == tag => Ok(()),
        other => Err(RpcError::Unexpected(format!(
            "expected </{}>, got {:?}",
            tag, other
        ))),
    }
}

/// Parse the contents of a `<value>` whose start tag has been consumed,
/// through to (and including) its end tag. Untyped text is a string.
fn parse_value<R: std::io::Read>(reader: &mut EventReader<R>) -> Result<RpcValue, RpcError> {
    let mut text = String::new();
    loop {
        match reader.next()? {
            ReaderEvent::Characters(s) | ReaderEvent::CData(s) | ReaderEvent::Whitespace(s) => {
                text.push_str(&s);
            }
            ReaderEvent::EndElement { name } if name.local_name == "value" => {
                return Ok(RpcValue::Str(text));
            }
            ReaderEvent::StartElement { name, .. } => {
                let value = parse_typed(reader, &name.local_name)?;
                expect_end(reader, "value")?;
                return Ok(value);
            }
            ReaderEvent::Comment(_) | ReaderEvent::ProcessingInstruction { .. } => continue,
            other => {
                return Err(RpcError::Unexpected(format!(
                    "unexpected event inside <value>: {:?}",
                    other
                )))
            }
        }
    }
}

fn parse_typed<R: std::io::Read>(
    reader: &mut EventReader<R>,
    tag: &str,
) -> Result<RpcValue, RpcError> {
    match tag {
        "int" | "i4" | "i8" => {
            let text = read_text(reader, tag)?;
            text.trim()
                .parse::<i64>()
                .map(RpcValue::Int)
                .map_err(|e| RpcError::Unexpected(format!("bad integer '{}': {}", text, e)))
        }
        "boolean" => {
            let text = read_text(reader, tag)?;
            match text.trim() {
                "1" | "true" => Ok(RpcValue::Bool(true)),
                "0" | "false" => Ok(RpcValue::Bool(false)),
                other => Err(RpcError::Unexpected(format!("bad boolean '{}'", other))),
            }
        }
        "double" => {
            let text = read_text(reader, tag)?;
            text.trim()
                .parse::<f64>()
                .map(RpcValue::Double)
                .map_err(|e| RpcError::Unexpected(format!("bad double '{}': {}", text, e)))
        }
        "string" => Ok(RpcValue::Str(read_text(reader, tag)?)),
        "dateTime.iso8601" => Ok(RpcValue::DateTime(read_text(reader, tag)?.trim().to_string())),
        "array" => {
            expect_start(reader, "data")?;
            let mut items = Vec::new();
            loop {
                match next_significant(reader)? {
                    ReaderEvent::StartElement { name, .. } if name.local_name == "value" => {
                        items.push(parse_value(reader)?);
                    }
                    ReaderEvent::EndElement { name } if name.local_name == "data" => break,
                    other => {
                        return Err(RpcError::Unexpected(format!(
                            "unexpected event inside <data>: {:?}",
                            other
                        )))
                    }
                }
            }
            expect_end(reader, "array")?;
            Ok(RpcValue::Array(items))
        }
        "struct" => {
            let mut members = BTreeMap::new();
            loop {
                match next_significant(reader)? {
                    ReaderEvent::StartElement { name, .. } if name.local_name == "member" => {
                        expect_start(reader, "name")?;
                        let member_name = read_text(reader, "name")?;
                        expect_start(reader, "value")?;
                        let value = parse_value(reader)?;
                        expect_end(reader, "member")?;
                        members.insert(member_name, value);
                    }
                    ReaderEvent::EndElement { name } if name.local_name == "struct" => break,
                    other => {
                        return Err(RpcError::Unexpected(format!(
                            "unexpected event inside <struct>: {:?}",
                            other
                        )))
                    }
                }
            }
            Ok(RpcValue::Struct(members))
        }
        other => Err(RpcError::Unexpected(format!(
            "unsupported value type <{}>",
            other
        ))),
    }
}

fn read_text<R: std::io::Read>(reader: &mut EventReader<R>, tag: &str) -> Result<String, RpcError> {
    let mut text = String::new();
    loop {
        match reader.next()? {
            ReaderEvent::Characters(s) | ReaderEvent::CData(s) | ReaderEvent::Whitespace(s) => {
                text.push_str(&s)
            }
            ReaderEvent::EndElement { name } if name.local_name == tag => return Ok(text),
            ReaderEvent::Comment(_) => continue,
            other => {
                return Err(RpcError::Unexpected(format!(
                    "unexpected event inside <{}>: {:?}",
                    tag, other
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_method_call() {
        let xml = encode_call(
            "session.login_with_password",
            &[RpcValue::string("root"), RpcValue::string("s3cret")],
        )
        .unwrap();

        assert!(xml.contains("<methodName>session.login_with_password</methodName>"));
        assert!(xml.contains("<string>root</string>"));
        assert!(xml.contains("<string>s3cret</string>"));
    }

    #[test]
    fn escapes_markup_in_strings() {
        let xml = encode_call("VM.set_name_label", &[RpcValue::string("a <b> & c")]).unwrap();
        assert!(xml.contains("a &lt;b&gt; &amp; c"));
    }

    #[test]
    fn parses_scalar_response() {
        let body = r#"<?xml version="1.0"?>
            <methodResponse><params><param>
                <value><string>OpaqueRef:abc</string></value>
            </param></params></methodResponse>"#;
        let value = parse_response(body).unwrap();
        assert_eq!(value, RpcValue::Str("OpaqueRef:abc".into()));
    }

    #[test]
    fn parses_untyped_value_as_string() {
        let body = "<methodResponse><params><param><value>plain</value></param></params></methodResponse>";
        assert_eq!(parse_response(body).unwrap(), RpcValue::Str("plain".into()));
    }

    #[test]
    fn parses_nested_struct_and_array() {
        let body = r#"<methodResponse><params><param><value><struct>
            <member><name>Status</name><value>Success</value></member>
            <member><name>Value</name><value><array><data>
                <value><string>OpaqueRef:1</string></value>
                <value><string>OpaqueRef:2</string></value>
            </data></array></value></member>
        </struct></value></param></params></methodResponse>"#;

        let members = parse_response(body).unwrap().into_struct().unwrap();
        assert_eq!(members["Status"], RpcValue::Str("Success".into()));
        let refs = members["Value"].clone().into_array().unwrap();
        assert_eq!(refs.len(), 2);
    }

    #[test]
    fn parses_datetime_and_boolean() {
        let body = r#"<methodResponse><params><param><value><struct>
            <member><name>snapshot_time</name>
                <value><dateTime.iso8601>20240318T09:30:00Z</dateTime.iso8601></value></member>
            <member><name>is_a_snapshot</name>
                <value><boolean>1</boolean></value></member>
        </struct></value></param></params></methodResponse>"#;

        let members = parse_response(body).unwrap().into_struct().unwrap();
        assert_eq!(
            members["snapshot_time"],
            RpcValue::DateTime("20240318T09:30:00Z".into())
        );
        assert_eq!(members["is_a_snapshot"], RpcValue::Bool(true));
    }

    #[test]
    fn surfaces_faults() {
        let body = r#"<methodResponse><fault><value><struct>
            <member><name>faultCode</name><value><int>-32600</int></value></member>
            <member><name>faultString</name><value><string>parse error</string></value></member>
        </struct></value></fault></methodResponse>"#;

        match parse_response(body) {
            Err(RpcError::Fault { code, message }) => {
                assert_eq!(code, -32600);
                assert_eq!(message, "parse error");
            }
            other => panic!("expected fault, got {:?}", other),
        }
    }

    #[test]
    fn json_round_trip_preserves_record_bags() {
        let record = serde_json::json!({
            "uuid": "0a1b2c",
            "name_label": "db01",
            "is_a_template": false,
            "VCPUs_max": 4,
            "other_config": {"folder": "/prod", "custom": "kept"},
            "VBDs": ["OpaqueRef:1", "OpaqueRef:2"],
        });

        let back = RpcValue::from_json(record.clone()).into_json();
        assert_eq!(back, record);
    }
}
