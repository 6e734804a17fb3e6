//! HL7 v2 batch splitting, segment access and a basic transcoder.
//!
//! Only what routing needs is modelled: segments, fields, components and the
//! first repetition of a field. Full HL7 grammar and profile validation are
//! left to a real transcoder plugged in through [`Hl7Transcoder`].

use serde_json::{Map, Value, json};

use crate::error::{PipelineError, PipelineResult};

/// Batch and file envelope segments dropped by [`split_batch`].
const ENVELOPE_SEGMENTS: [&str; 4] = ["FHS", "BHS", "BTS", "FTS"];

/// Extension carrying the sender's processing id (`P`, `T`, `D`) on the
/// message header.
pub const PROCESSING_ID_EXTENSION_URL: &str =
    "https://reportstream.cdc.gov/fhir/StructureDefinition/source-processing-id";

fn segment_lines(text: &str) -> impl Iterator<Item = &str> {
    text.split(['\r', '\n'])
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
}

/// Splits a batch into one string per message, segments joined with `\r`.
///
/// Envelope segments are dropped; every `MSH` starts a new message. Content
/// before the first `MSH` comes back as a parse error in its place.
pub fn split_batch(text: &str) -> Vec<PipelineResult<String>> {
    let mut items = Vec::new();
    let mut current: Option<Vec<&str>> = None;
    let mut stray = Vec::new();

    for line in segment_lines(text) {
        let name = line.get(..3).unwrap_or(line);
        if ENVELOPE_SEGMENTS.contains(&name) {
            continue;
        }
        if name == "MSH" {
            if let Some(segments) = current.take() {
                items.push(Ok(segments.join("\r")));
            }
            current = Some(vec![line]);
        } else if let Some(segments) = current.as_mut() {
            segments.push(line);
        } else {
            stray.push(line);
        }
    }
    if let Some(segments) = current {
        items.push(Ok(segments.join("\r")));
    }
    if !stray.is_empty() {
        items.insert(
            0,
            Err(PipelineError::parse(format!(
                "{} segment(s) before the first MSH, starting with '{}'",
                stray.len(),
                stray[0].chars().take(3).collect::<String>()
            ))),
        );
    }
    items
}

/// One segment, with fields numbered as in the HL7 standard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    name: String,
    /// `fields[0]` is the segment name, so `fields[n]` is field `n`.
    fields: Vec<String>,
    component_separator: char,
    repetition_separator: char,
}

impl Segment {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Field `n`, first repetition. Empty fields are `None`.
    pub fn field(&self, n: usize) -> Option<&str> {
        let raw = self.fields.get(n)?;
        if self.name == "MSH" && n <= 2 {
            return Some(raw.as_str());
        }
        let first = raw.split(self.repetition_separator).next().unwrap_or_default();
        (!first.is_empty()).then_some(first)
    }

    /// Component `c` (1-based) of field `n`.
    pub fn component(&self, n: usize, c: usize) -> Option<&str> {
        let value = self
            .field(n)?
            .split(self.component_separator)
            .nth(c.checked_sub(1)?)?;
        (!value.is_empty()).then_some(value)
    }
}

/// A parsed HL7 v2 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hl7Message {
    segments: Vec<Segment>,
}

impl Hl7Message {
    /// Parses a single message. Separators come from the MSH header.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Parse` if the message does not start with a
    /// well-formed MSH segment.
    pub fn parse(text: &str) -> PipelineResult<Self> {
        let mut lines = segment_lines(text);
        let header = lines
            .next()
            .ok_or_else(|| PipelineError::parse("empty HL7 message"))?;
        if !header.starts_with("MSH") {
            return Err(PipelineError::parse("HL7 message must start with MSH"));
        }
        let mut header_chars = header.chars().skip(3);
        let field_separator = header_chars
            .next()
            .ok_or_else(|| PipelineError::parse("MSH is missing its field separator"))?;
        let encoding: Vec<char> = header_chars.take_while(|c| *c != field_separator).collect();
        let (Some(&component_separator), Some(&repetition_separator)) =
            (encoding.first(), encoding.get(1))
        else {
            return Err(PipelineError::parse("MSH-2 encoding characters are incomplete"));
        };

        let make = |line: &str, is_header: bool| {
            let mut fields: Vec<String> = line.split(field_separator).map(str::to_string).collect();
            if is_header {
                // MSH-1 is the separator itself
                fields.insert(1, field_separator.to_string());
            }
            Segment {
                name: fields.first().cloned().unwrap_or_default(),
                fields,
                component_separator,
                repetition_separator,
            }
        };

        let mut segments = vec![make(header, true)];
        segments.extend(lines.map(|line| make(line, false)));
        Ok(Self { segments })
    }

    pub fn segments(&self, name: &str) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(move |s| s.name == name)
    }

    pub fn all_segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Field `n` of the first segment called `segment`.
    pub fn field(&self, segment: &str, n: usize) -> Option<&str> {
        self.segments(segment).next()?.field(n)
    }

    pub fn component(&self, segment: &str, n: usize, c: usize) -> Option<&str> {
        self.segments(segment).next()?.component(n, c)
    }

    /// MSH-10, the sender's message control id.
    pub fn control_id(&self) -> Option<&str> {
        self.field("MSH", 10)
    }
}

/// Converts between HL7 v2 messages and canonical bundles.
pub trait Hl7Transcoder: Send + Sync {
    /// # Errors
    ///
    /// Returns `PipelineError::Conversion` if the message cannot be mapped.
    fn decode(&self, message: &Hl7Message) -> PipelineResult<Value>;

    /// # Errors
    ///
    /// Returns `PipelineError::Conversion` if the bundle cannot be rendered.
    fn encode(&self, bundle: &Value) -> PipelineResult<String>;
}

/// Maps MSH, PID, OBR and OBX to MessageHeader, Patient, DiagnosticReport and
/// Observation.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicHl7Transcoder;

fn coding_system(hl7: Option<&str>) -> Option<&str> {
    match hl7? {
        "LN" => Some("http://loinc.org"),
        "SCT" => Some("http://snomed.info/sct"),
        other => Some(other),
    }
}

fn hl7_system(system: &str) -> &str {
    match system {
        "http://loinc.org" => "LN",
        "http://snomed.info/sct" => "SCT",
        other => other,
    }
}

fn coding(segment: &Segment, field: usize) -> Value {
    let mut coding = Map::new();
    if let Some(system) = coding_system(segment.component(field, 3)) {
        coding.insert("system".into(), json!(system));
    }
    if let Some(code) = segment.component(field, 1) {
        coding.insert("code".into(), json!(code));
    }
    if let Some(display) = segment.component(field, 2) {
        coding.insert("display".into(), json!(display));
    }
    Value::Object(coding)
}

fn observation_status(code: Option<&str>) -> &'static str {
    match code {
        Some("F") => "final",
        Some("P") => "preliminary",
        Some("C") => "corrected",
        Some("X") => "cancelled",
        Some("W") => "entered-in-error",
        _ => "unknown",
    }
}

/// `YYYYMMDD...` to `YYYY-MM-DD`.
fn hl7_date(value: &str) -> Option<String> {
    let digits = value.get(..8)?;
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("{}-{}-{}", &digits[..4], &digits[4..6], &digits[6..8]))
}

fn entry(kind: &str, id: &str, resource: Value) -> Value {
    json!({"fullUrl": format!("{kind}/{id}"), "resource": resource})
}

impl Hl7Transcoder for BasicHl7Transcoder {
    fn decode(&self, message: &Hl7Message) -> PipelineResult<Value> {
        let control_id = message
            .control_id()
            .ok_or_else(|| PipelineError::conversion("MSH-10 message control id is missing"))?;
        let event = message
            .component("MSH", 9, 2)
            .ok_or_else(|| PipelineError::conversion("MSH-9 message type is missing"))?;

        let mut header = json!({
            "resourceType": "MessageHeader",
            "id": control_id,
            "eventCoding": {
                "system": "http://terminology.hl7.org/CodeSystem/v2-0003",
                "code": event,
            },
        });
        if let Some(source) = message.component("MSH", 4, 1) {
            header["source"] = json!({"name": source});
        }
        if let Some(processing_id) = message.component("MSH", 11, 1) {
            header["meta"] = json!({"extension": [{
                "url": PROCESSING_ID_EXTENSION_URL,
                "valueCodeableConcept": {"coding": [{"code": processing_id}]},
            }]});
        }
        let mut entries = vec![entry("MessageHeader", control_id, header)];

        let mut patient_ref = None;
        if let Some(pid) = message.segments("PID").next() {
            let id = pid.component(3, 1).unwrap_or("patient-1");
            let mut patient = json!({"resourceType": "Patient", "id": id});
            if pid.component(5, 1).is_some() || pid.component(5, 2).is_some() {
                let mut name = Map::new();
                if let Some(family) = pid.component(5, 1) {
                    name.insert("family".into(), json!(family));
                }
                if let Some(given) = pid.component(5, 2) {
                    name.insert("given".into(), json!([given]));
                }
                patient["name"] = json!([name]);
            }
            if let Some(birth_date) = pid.field(7).and_then(hl7_date) {
                patient["birthDate"] = json!(birth_date);
            }
            let mut address = Map::new();
            for (component, key) in [(3, "city"), (4, "state"), (5, "postalCode")] {
                if let Some(value) = pid.component(11, component) {
                    address.insert(key.into(), json!(value));
                }
            }
            if !address.is_empty() {
                patient["address"] = json!([address]);
            }
            patient_ref = Some(format!("Patient/{id}"));
            entries.push(entry("Patient", id, patient));
        }

        // OBX segments belong to the OBR that precedes them
        let mut report: Option<(String, Value)> = None;
        let mut finished_reports = Vec::new();
        let mut observation_count = 0;
        for segment in message.all_segments() {
            match segment.name() {
                "OBR" => {
                    if let Some(done) = report.take() {
                        finished_reports.push(done);
                    }
                    let id = format!("dr-{}", finished_reports.len() + 1);
                    let resource = json!({
                        "resourceType": "DiagnosticReport",
                        "id": id,
                        "status": "final",
                        "code": {"coding": [coding(segment, 4)]},
                        "result": [],
                    });
                    report = Some((id, resource));
                }
                "OBX" => {
                    observation_count += 1;
                    let id = format!("obs-{observation_count}");
                    let mut observation = json!({
                        "resourceType": "Observation",
                        "id": id,
                        "status": observation_status(segment.field(11)),
                        "code": {"coding": [coding(segment, 3)]},
                    });
                    match segment.field(2) {
                        Some("CE" | "CWE") => {
                            observation["valueCodeableConcept"] =
                                json!({"coding": [coding(segment, 5)]});
                        }
                        _ => {
                            if let Some(value) = segment.field(5) {
                                observation["valueString"] = json!(value);
                            }
                        }
                    }
                    if let Some(subject) = &patient_ref {
                        observation["subject"] = json!({"reference": subject});
                    }
                    if let Some((_, resource)) = report.as_mut() {
                        if let Some(results) = resource["result"].as_array_mut() {
                            results.push(json!({"reference": format!("Observation/{id}")}));
                        }
                    }
                    entries.push(entry("Observation", &id, observation));
                }
                _ => {}
            }
        }
        if let Some(done) = report {
            finished_reports.push(done);
        }
        for (id, resource) in finished_reports {
            entries.push(entry("DiagnosticReport", &id, resource));
        }

        Ok(json!({
            "resourceType": "Bundle",
            "type": "message",
            "identifier": {"value": control_id},
            "entry": entries,
        }))
    }

    fn encode(&self, bundle: &Value) -> PipelineResult<String> {
        let resources: Vec<&Value> = crate::bundle::resources(bundle).collect();
        let of_type = |kind: &'static str| {
            resources
                .iter()
                .copied()
                .filter(move |r| r.get("resourceType").and_then(Value::as_str) == Some(kind))
        };
        let text = |value: &Value, pointer: &str| {
            value
                .pointer(pointer)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        let header = of_type("MessageHeader")
            .next()
            .ok_or_else(|| PipelineError::conversion("bundle has no MessageHeader"))?;
        let control_id = crate::bundle::tracking_id(bundle).unwrap_or_else(|| text(header, "/id"));
        let processing_id = header
            .pointer("/meta/extension")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .find(|ext| ext.get("url").and_then(Value::as_str) == Some(PROCESSING_ID_EXTENSION_URL))
            .and_then(|ext| ext.pointer("/valueCodeableConcept/coding/0/code"))
            .and_then(Value::as_str)
            .unwrap_or("P");

        let mut segments = vec![format!(
            "MSH|^~\\&|OctoRouter|{}|||||ORU^{}^ORU_R01|{}|{}|2.5.1",
            text(header, "/source/name"),
            text(header, "/eventCoding/code"),
            control_id,
            processing_id,
        )];

        if let Some(patient) = of_type("Patient").next() {
            let birth_date = text(patient, "/birthDate").replace('-', "");
            segments.push(format!(
                "PID|1||{}||{}^{}||{}||||^^{}^{}^{}",
                text(patient, "/id"),
                text(patient, "/name/0/family"),
                text(patient, "/name/0/given/0"),
                birth_date,
                text(patient, "/address/0/city"),
                text(patient, "/address/0/state"),
                text(patient, "/address/0/postalCode"),
            ));
        }

        let coded = |coding: &Value| {
            format!(
                "{}^{}^{}",
                text(coding, "/code"),
                text(coding, "/display"),
                hl7_system(&text(coding, "/system")),
            )
        };
        for (index, observation) in of_type("Observation").enumerate() {
            let (value_type, value) = match observation.pointer("/valueCodeableConcept/coding/0") {
                Some(coding) => ("CWE", coded(coding)),
                None => ("ST", text(observation, "/valueString")),
            };
            let status = match text(observation, "/status").as_str() {
                "final" => "F",
                "preliminary" => "P",
                "corrected" => "C",
                "cancelled" => "X",
                "entered-in-error" => "W",
                _ => "",
            };
            let code = observation
                .pointer("/code/coding/0")
                .map(&coded)
                .unwrap_or_default();
            segments.push(format!(
                "OBX|{}|{value_type}|{code}||{value}||||||{status}",
                index + 1
            ));
        }

        Ok(segments.join("\r"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MESSAGE: &str = "MSH|^~\\&|LAB|Example Lab^1234^CLIA|||20230101120000||ORU^R01^ORU_R01|MSG-001|P|2.5.1\r\
PID|1||PAT-1^^^LAB||Doe^Jane||19800102|F|||1 Main St^^Springfield^IG^12345\r\
OBR|1|||94558-4^SARS-CoV-2 Ag^LN\r\
OBX|1|CWE|94558-4^SARS-CoV-2 Ag^LN||260373001^Detected^SCT||||||F\r\
OBX|2|ST|95418-0^Employed in healthcare^LN||N||||||P";

    #[test]
    fn test_split_batch() {
        let batch = format!(
            "FHS|^~\\&\nBHS|^~\\&\n{MESSAGE}\n{}\nBTS|2\nFTS|1\n",
            MESSAGE.replace("MSG-001", "MSG-002")
        );
        let items = split_batch(&batch);
        assert_eq!(items.len(), 2);
        let first = items[0].as_ref().unwrap();
        assert!(first.starts_with("MSH|"));
        assert!(first.contains("MSG-001"));
        assert_eq!(first.split('\r').count(), 5);
        assert!(items[1].as_ref().unwrap().contains("MSG-002"));
    }

    #[test]
    fn test_split_batch_stray_content() {
        let items = split_batch(&format!("PID|1||x\n{MESSAGE}"));
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], Err(PipelineError::Parse { .. })));
        assert!(items[1].is_ok());
        assert!(split_batch("  \n\n").is_empty());
    }

    #[test]
    fn test_parse_fields_and_components() {
        let message = Hl7Message::parse(MESSAGE).unwrap();
        assert_eq!(message.field("MSH", 1), Some("|"));
        assert_eq!(message.field("MSH", 2), Some("^~\\&"));
        assert_eq!(message.control_id(), Some("MSG-001"));
        assert_eq!(message.component("MSH", 9, 2), Some("R01"));
        assert_eq!(message.component("PID", 11, 4), Some("IG"));
        assert_eq!(message.component("PID", 11, 2), None);
        assert_eq!(message.segments("OBX").count(), 2);
        assert_eq!(message.field("PID", 99), None);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Hl7Message::parse("PID|1").is_err());
        assert!(Hl7Message::parse("").is_err());
        assert!(Hl7Message::parse("MSH|").is_err());
    }

    #[test]
    fn test_decode() {
        let bundle = BasicHl7Transcoder
            .decode(&Hl7Message::parse(MESSAGE).unwrap())
            .unwrap();
        crate::bundle::validate_bundle(&bundle).unwrap();
        assert_eq!(crate::bundle::tracking_id(&bundle).as_deref(), Some("MSG-001"));

        let resources: Vec<_> = crate::bundle::resources(&bundle).collect();
        assert_eq!(resources[0]["eventCoding"]["code"], "R01");
        assert_eq!(resources[0]["source"]["name"], "Example Lab");
        assert_eq!(resources[1]["address"][0]["state"], "IG");
        assert_eq!(resources[1]["birthDate"], "1980-01-02");

        let observations: Vec<_> = crate::bundle::observations(&bundle).collect();
        assert_eq!(observations.len(), 2);
        assert_eq!(observations[0]["code"]["coding"][0]["system"], "http://loinc.org");
        assert_eq!(
            observations[0]["valueCodeableConcept"]["coding"][0]["code"],
            "260373001"
        );
        assert_eq!(observations[1]["valueString"], "N");
        assert_eq!(observations[1]["status"], "preliminary");

        let report = resources
            .iter()
            .find(|r| r["resourceType"] == "DiagnosticReport")
            .unwrap();
        assert_eq!(report["result"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_processing_id_reachable_by_expression() {
        let bundle = BasicHl7Transcoder
            .decode(&Hl7Message::parse(MESSAGE).unwrap())
            .unwrap();
        let engine = crate::expression::ExpressionEngine::new();
        assert!(engine
            .evaluate_condition(
                &format!(
                    "Bundle.entry.resource.ofType(MessageHeader).meta.extension('{PROCESSING_ID_EXTENSION_URL}').value.coding.code = 'P'"
                ),
                &bundle
            )
            .unwrap());
    }

    #[test]
    fn test_decode_requires_control_id() {
        let message = Hl7Message::parse("MSH|^~\\&|LAB||||||ORU^R01").unwrap();
        assert!(matches!(
            BasicHl7Transcoder.decode(&message),
            Err(PipelineError::Conversion { .. })
        ));
    }

    #[test]
    fn test_encode_decode_keeps_routing_fields() {
        let transcoder = BasicHl7Transcoder;
        let bundle = transcoder.decode(&Hl7Message::parse(MESSAGE).unwrap()).unwrap();
        let encoded = transcoder.encode(&bundle).unwrap();
        assert!(encoded.starts_with("MSH|^~\\&|OctoRouter|Example Lab"));

        let again = transcoder.decode(&Hl7Message::parse(&encoded).unwrap()).unwrap();
        let resources: Vec<_> = crate::bundle::resources(&again).collect();
        assert_eq!(crate::bundle::tracking_id(&again).as_deref(), Some("MSG-001"));
        assert_eq!(resources[1]["address"][0]["state"], "IG");
        let observations: Vec<_> = crate::bundle::observations(&again).collect();
        assert_eq!(observations[0]["code"]["coding"][0]["code"], "94558-4");
        assert_eq!(observations[0]["status"], "final");
    }
}
