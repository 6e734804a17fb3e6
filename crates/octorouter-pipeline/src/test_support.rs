//! Fixtures shared by the stage unit tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use octorouter_core::{MimeFormat, Report, ReportId, TaskAction, Topic};
use octorouter_db_memory::MemoryStores;
use octorouter_lookup::{LookupTable, TableRegistry};
use octorouter_storage::{
    BlobFolder, BlobInfo, BlobStore, DynBlobStore, DynLineageStore, DynWorkQueue, LineageStore,
};
use serde_json::{Value, json};

use crate::context::PipelineContext;
use crate::message::{
    ConvertMessage, DestinationFilterMessage, QueueMessage, ReceiveMessage, ReceiverMessage,
};
use crate::settings::InMemorySettings;
use crate::stage::RecordingTransport;

pub const SETTINGS: &str = r#"
[[senders]]
name = "default"
organization = "lab"
topic = "covid-19"
format = "HL7"

[[senders]]
name = "fhir"
organization = "lab"
topic = "covid-19"
format = "FHIR"

[[senders]]
name = "strict"
organization = "lab"
topic = "covid-19"
format = "HL7"
route_invalid_items = false

[[senders]]
name = "retired"
organization = "lab"
topic = "covid-19"
format = "HL7"
customer_status = "inactive"

[[receivers]]
name = "elr"
organization = "ig-phd"
topic = "covid-19"
jurisdictional_filter = ["Bundle.entry.resource.ofType(Patient).address.state = 'IG'"]

[[receivers]]
name = "old"
organization = "ig-phd"
topic = "covid-19"
customer_status = "inactive"

[[receivers]]
name = "elr"
organization = "other-phd"
topic = "covid-19"
jurisdictional_filter = ["Bundle.entry.resource.ofType(Patient).address.state = 'OT'"]

[[receivers]]
name = "flu"
organization = "ig-phd"
topic = "flu"
"#;

/// Two messages, both from a patient in IG. The second OBX of each is an
/// ask-at-order-entry question.
pub const SAMPLE_HL7: &str = "MSH|^~\\&|LAB|Example Lab|||20230101120000||ORU^R01^ORU_R01|MSG-001|P|2.5.1\r\
PID|1||PAT-1^^^LAB||Doe^Jane||19800102|F|||1 Main St^^Springfield^IG^12345\r\
OBR|1|||94558-4^SARS-CoV-2 Ag^LN\r\
OBX|1|CWE|94558-4^SARS-CoV-2 Ag^LN||260373001^Detected^SCT||||||F\r\
OBX|2|ST|95418-0^Employed in healthcare^LN||N||||||F\r\
MSH|^~\\&|LAB|Example Lab|||20230101120000||ORU^R01^ORU_R01|MSG-002|P|2.5.1\r\
PID|1||PAT-2^^^LAB||Roe^Rick||19900304|M|||2 Main St^^Springfield^IG^12345\r\
OBR|1|||94558-4^SARS-CoV-2 Ag^LN\r\
OBX|1|CWE|94558-4^SARS-CoV-2 Ag^LN||260415000^Not detected^SCT||||||F\r";

pub const MAPPING_CSV: &str = "Code,Condition Code,Condition Code System,Condition Name\n\
94558-4,840539006,SNOMEDCT,COVID-19\n\
95418-0,AOE,LOCAL,Ask at order entry\n\
87949-4,6142004,SNOMEDCT,Influenza\n";

pub fn mapping_table() -> LookupTable {
    LookupTable::from_csv_reader("observation-mapping", 1, MAPPING_CSV.as_bytes())
        .unwrap_or_else(|e| panic!("mapping table: {e}"))
}

/// A stamped single-item bundle for a patient in `state`.
pub fn sample_bundle(state: &str) -> Value {
    let stamp = |code: &str, display: &str| {
        json!([{
            "url": crate::bundle::CONDITION_CODE_EXTENSION_URL,
            "valueCoding": {"system": "SNOMEDCT", "code": code, "display": display}
        }])
    };
    json!({
        "resourceType": "Bundle",
        "type": "message",
        "identifier": {"value": "MSG-100"},
        "entry": [
            {"fullUrl": "MessageHeader/MSG-100", "resource": {
                "resourceType": "MessageHeader", "id": "MSG-100",
                "eventCoding": {"code": "R01"},
                "meta": {"extension": [{
                    "url": crate::hl7::PROCESSING_ID_EXTENSION_URL,
                    "valueCodeableConcept": {"coding": [{"code": "P"}]}
                }]}
            }},
            {"fullUrl": "Patient/p-1", "resource": {
                "resourceType": "Patient", "id": "p-1",
                "address": [{"state": state}]
            }},
            {"fullUrl": "Observation/obs-1", "resource": {
                "resourceType": "Observation", "id": "obs-1",
                "code": {"coding": [{
                    "system": "http://loinc.org", "code": "94558-4",
                    "extension": stamp("840539006", "COVID-19")
                }]}
            }},
            {"fullUrl": "Observation/obs-2", "resource": {
                "resourceType": "Observation", "id": "obs-2",
                "code": {"coding": [{
                    "system": "http://loinc.org", "code": "95418-0",
                    "extension": stamp("AOE", "Ask at order entry")
                }]}
            }},
            {"fullUrl": "DiagnosticReport/dr-1", "resource": {
                "resourceType": "DiagnosticReport", "id": "dr-1",
                "result": [{"reference": "Observation/obs-1"}, {"reference": "Observation/obs-2"}]
            }}
        ]
    })
}

pub struct TestPipeline {
    pub stores: MemoryStores,
    pub settings: Arc<InMemorySettings>,
    pub transport: Arc<RecordingTransport>,
    pub pipeline: Arc<PipelineContext>,
}

impl TestPipeline {
    pub fn new() -> Self {
        Self::with_settings(SETTINGS)
    }

    pub fn with_settings(raw: &str) -> Self {
        Self::build(raw, |pipeline| pipeline)
    }

    /// Builds the fixture, letting the caller adjust the context first.
    pub fn build(raw: &str, adjust: impl FnOnce(PipelineContext) -> PipelineContext) -> Self {
        let stores = MemoryStores::default();
        let settings = Arc::new(
            InMemorySettings::from_toml_str(raw).unwrap_or_else(|e| panic!("settings: {e}")),
        );
        let tables = TableRegistry::new_shared();
        tables.insert(mapping_table());
        let transport = Arc::new(RecordingTransport::new());

        let blobs: DynBlobStore = stores.blobs.clone();
        let queue: DynWorkQueue = stores.queue.clone();
        let lineage: DynLineageStore = stores.lineage.clone();
        let pipeline = PipelineContext::new(blobs, queue, lineage, settings.clone())
            .with_tables(tables)
            .with_transport(transport.clone());

        Self {
            stores,
            settings,
            transport,
            pipeline: Arc::new(adjust(pipeline)),
        }
    }

    pub async fn upload(&self, bytes: &[u8], format: MimeFormat, folder: BlobFolder) -> BlobInfo {
        self.stores
            .blobs
            .upload(bytes, format, folder, None, ReportId::new())
            .await
            .unwrap_or_else(|e| panic!("upload: {e}"))
    }

    /// Records `report` with a body, as an upstream stage would have.
    async fn record(&self, report: Report, bytes: &[u8], folder: BlobFolder) -> Report {
        let info = self.upload(bytes, report.format, folder).await;
        let report = report.with_body(info.url, info.digest);
        self.stores
            .lineage
            .record_report(&report)
            .await
            .unwrap_or_else(|e| panic!("record: {e}"));
        self.stores
            .lineage
            .record_lineage(&report.lineage)
            .await
            .unwrap_or_else(|e| panic!("lineage: {e}"));
        report
    }

    pub async fn receive_message(
        &self,
        bytes: &[u8],
        format: MimeFormat,
        client_id: &str,
    ) -> QueueMessage {
        let info = self.upload(bytes, format, BlobFolder::Receive).await;
        let headers = BTreeMap::from([
            ("client_id".to_string(), client_id.to_string()),
            ("content-type".to_string(), format.mime_type().to_string()),
        ]);
        QueueMessage::Receive(ReceiveMessage {
            report_id: ReportId::new(),
            blob_url: info.url,
            digest: info.digest,
            blob_subfolder: None,
            headers,
        })
    }

    /// A convert message for a root report submitted by `sender`.
    pub async fn convert_message(
        &self,
        bytes: &[u8],
        format: MimeFormat,
        sender: &str,
    ) -> QueueMessage {
        let topic = Topic::new("covid-19");
        let root = Report::new(format, topic.clone(), TaskAction::Convert).with_sender(sender);
        let root = self.record(root, bytes, BlobFolder::Receive).await;
        let (blob_url, digest) = body_of(&root);
        QueueMessage::Convert(ConvertMessage {
            report_id: root.id,
            blob_url,
            digest,
            blob_subfolder: None,
            topic,
            schema_name: None,
        })
    }

    /// A destination-filter message for `bundle`, with a recorded root parent.
    pub async fn destination_filter_message(&self, bundle: &Value) -> QueueMessage {
        let (report, topic) = self.child_of_root(bundle, TaskAction::DestinationFilter).await;
        let (blob_url, digest) = body_of(&report);
        QueueMessage::DestinationFilter(DestinationFilterMessage {
            report_id: report.id,
            blob_url,
            digest,
            blob_subfolder: None,
            topic,
        })
    }

    /// A receiver-filter message for `bundle`, addressed to `receiver`.
    pub async fn receiver_filter_message(&self, bundle: &Value, receiver: &str) -> QueueMessage {
        let (report, topic) = self.child_of_root(bundle, TaskAction::ReceiverFilter).await;
        let (blob_url, digest) = body_of(&report);
        QueueMessage::ReceiverFilter(ReceiverMessage {
            report_id: report.id,
            blob_url,
            digest,
            blob_subfolder: None,
            topic,
            receiver_full_name: receiver.to_string(),
        })
    }

    async fn child_of_root(&self, bundle: &Value, next_action: TaskAction) -> (Report, Topic) {
        let topic = Topic::new("covid-19");
        let bytes = bundle.to_string().into_bytes();
        let root = Report::new(MimeFormat::Fhir, topic.clone(), TaskAction::Convert)
            .with_sender("lab.fhir");
        let root = self.record(root, &bytes, BlobFolder::Receive).await;
        let child = Report::new(MimeFormat::Fhir, topic.clone(), next_action)
            .with_sender("lab.fhir")
            .with_parent(root.id, 1, octorouter_core::Digest::of(&bytes), None);
        let child = self.record(child, &bytes, BlobFolder::Process).await;
        (child, topic)
    }
}

fn body_of(report: &Report) -> (url::Url, octorouter_core::Digest) {
    match (&report.body_url, &report.digest) {
        (Some(url), Some(digest)) => (url.clone(), digest.clone()),
        _ => panic!("report {} has no body", report.id),
    }
}
