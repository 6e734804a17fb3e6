//! End-to-end routing tests.
//!
//! These drive reports through the stage runners against the in-memory
//! stores, the way the server wires them.

use std::collections::BTreeMap;
use std::sync::Arc;

use octorouter_core::{MimeFormat, PipelineEvent, PipelineEventKind, ReportId, TaskAction};
use octorouter_db_memory::MemoryStores;
use octorouter_lookup::{LookupTable, TableRegistry};
use octorouter_pipeline::message::ReceiveMessage;
use octorouter_pipeline::prelude::*;
use octorouter_pipeline::queues;
use octorouter_pipeline::{ExpressionEngine, FilterEngine, RecordingTransport};
use octorouter_storage::{
    ActionOutcome, BlobFolder, BlobStore, DynBlobStore, DynLineageStore, DynWorkQueue,
    LineageStore, WorkQueue,
};
use serde_json::json;
use tokio::sync::broadcast;

const SETTINGS: &str = r#"
[[senders]]
name = "fhir"
organization = "lab"
topic = "covid-19"
format = "FHIR"

[[senders]]
name = "hl7"
organization = "lab"
topic = "covid-19"
format = "HL7"

[[receivers]]
name = "elr"
organization = "ig-phd"
topic = "covid-19"
jurisdictional_filter = ["Bundle.entry.resource.ofType(Patient).address.state = 'IG'"]

[[receivers]]
name = "legacy"
organization = "ig-phd"
topic = "covid-19"
customer_status = "inactive"
jurisdictional_filter = ["Bundle.entry.resource.ofType(Patient).address.state = 'IG'"]
"#;

const MAPPING_CSV: &str = "Code,Condition Code,Condition Code System,Condition Name\n\
94558-4,840539006,SNOMEDCT,COVID-19\n";

const LIVD_CSV: &str = "Manufacturer,Model,Testkit Name ID,Equipment UID,Test Performed LOINC Code,processing_mode_code\n\
Abbott,BinaxNOW COVID-19 Ag Card,10811877011269,BinaxNOW-Reader,94558-4,\n\
Quidel,Sofia 2 Flu + SARS Antigen FIA,10758750002467,Sofia 2,94558-4,\n";

const HL7_MESSAGE: &str = "MSH|^~\\&|LAB|Example Lab|||20230101120000||ORU^R01^ORU_R01|MSG-042|P|2.5.1\r\
PID|1||PAT-9^^^LAB||Doe^Jane||19800102|F|||1 Main St^^Springfield^IG^12345\r\
OBR|1|||94558-4^SARS-CoV-2 Ag^LN\r\
OBX|1|CWE|94558-4^SARS-CoV-2 Ag^LN||260373001^Detected^SCT||||||F\r";

struct Harness {
    stores: MemoryStores,
    transport: Arc<RecordingTransport>,
    pipeline: Arc<PipelineContext>,
}

impl Harness {
    fn new() -> Self {
        Self::with_settings(SETTINGS)
    }

    fn with_settings(settings: &str) -> Self {
        let stores = MemoryStores::default();
        let settings = Arc::new(InMemorySettings::from_toml_str(settings).unwrap());
        let tables = TableRegistry::new_shared();
        tables.insert(
            LookupTable::from_csv_reader("observation-mapping", 1, MAPPING_CSV.as_bytes()).unwrap(),
        );
        tables.insert(
            LookupTable::from_csv_reader("LIVD-SARS-CoV-2", 1, LIVD_CSV.as_bytes()).unwrap(),
        );
        let expressions = ExpressionEngine::new().with_tables(tables.clone());
        let filters = FilterEngine::new(Arc::new(expressions));
        let transport = Arc::new(RecordingTransport::new());

        let blobs: DynBlobStore = stores.blobs.clone();
        let queue: DynWorkQueue = stores.queue.clone();
        let lineage: DynLineageStore = stores.lineage.clone();
        let pipeline = PipelineContext::new(blobs, queue, lineage, settings)
            .with_tables(tables)
            .with_filters(filters)
            .with_transport(transport.clone());

        Self {
            stores,
            transport,
            pipeline: Arc::new(pipeline),
        }
    }

    /// Uploads a submission and queues it for the receive stage.
    async fn submit(&self, body: &[u8], format: MimeFormat, client_id: &str) -> ReportId {
        let report_id = ReportId::new();
        let info = self
            .stores
            .blobs
            .upload(body, format, BlobFolder::Receive, None, report_id)
            .await
            .unwrap();
        let message = QueueMessage::Receive(ReceiveMessage {
            report_id,
            blob_url: info.url,
            digest: info.digest,
            blob_subfolder: None,
            headers: BTreeMap::from([
                ("client_id".to_string(), client_id.to_string()),
                ("Content-Type".to_string(), format.mime_type().to_string()),
            ]),
        });
        self.enqueue(&message).await;
        report_id
    }

    async fn enqueue(&self, message: &QueueMessage) {
        let payload = message
            .encode(self.pipeline.config.max_message_bytes)
            .unwrap();
        self.stores
            .queue
            .send(message.queue_name(), payload)
            .await
            .unwrap();
    }

    /// Runs every stage once, in pipeline order.
    async fn drain(&self) {
        let p = &self.pipeline;
        let limit = 100;
        StageRunner::new(ReceiveStage::new(p.clone()), p.clone())
            .process_batch(limit)
            .await
            .unwrap();
        StageRunner::new(ConvertStage::new(p.clone()), p.clone())
            .process_batch(limit)
            .await
            .unwrap();
        StageRunner::new(DestinationFilterStage::new(p.clone()), p.clone())
            .process_batch(limit)
            .await
            .unwrap();
        StageRunner::new(ReceiverFilterStage::new(p.clone()), p.clone())
            .process_batch(limit)
            .await
            .unwrap();
        StageRunner::new(TranslateStage::new(p.clone()), p.clone())
            .process_batch(limit)
            .await
            .unwrap();
        StageRunner::new(BatchStage::new(p.clone()), p.clone())
            .process_batch(limit)
            .await
            .unwrap();
        StageRunner::new(SendStage::new(p.clone()), p.clone())
            .process_batch(limit)
            .await
            .unwrap();
    }

    async fn queued(&self, queue: &str) -> Vec<QueueMessage> {
        self.stores
            .queue
            .peek(queue)
            .await
            .iter()
            .map(|raw| QueueMessage::decode(raw, self.pipeline.config.max_message_bytes).unwrap())
            .collect()
    }
}

fn collect_events(rx: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn ig_bundle() -> String {
    json!({
        "resourceType": "Bundle",
        "type": "message",
        "identifier": {"value": "MSG-900"},
        "entry": [
            {"resource": {"resourceType": "MessageHeader", "id": "MSG-900"}},
            {"resource": {"resourceType": "Patient", "id": "p-1", "address": [{"state": "IG"}]}},
            {"resource": {
                "resourceType": "Observation", "id": "obs-1",
                "code": {"coding": [{"system": "http://loinc.org", "code": "94558-4"}]}
            }}
        ]
    })
    .to_string()
}

#[tokio::test]
async fn test_single_item_routes_to_active_receiver_only() {
    let harness = Harness::new();
    let mut events = harness.pipeline.events.subscribe();
    harness
        .submit(ig_bundle().as_bytes(), MimeFormat::Fhir, "lab.fhir")
        .await;

    let p = &harness.pipeline;
    for stage_runs in [
        StageRunner::new(ReceiveStage::new(p.clone()), p.clone())
            .process_batch(10)
            .await,
        StageRunner::new(ConvertStage::new(p.clone()), p.clone())
            .process_batch(10)
            .await,
        StageRunner::new(DestinationFilterStage::new(p.clone()), p.clone())
            .process_batch(10)
            .await,
    ] {
        assert_eq!(stage_runs.unwrap(), 1);
    }

    let successors = harness.queued(queues::RECEIVER_FILTER).await;
    assert_eq!(successors.len(), 1);
    assert_eq!(successors[0].receiver_full_name(), Some("ig-phd.elr"));

    let not_routed: Vec<String> = collect_events(&mut events)
        .into_iter()
        .filter_map(|event| match event.kind {
            PipelineEventKind::ItemNotRouted { receiver, .. } => Some(receiver),
            _ => None,
        })
        .collect();
    assert_eq!(not_routed, vec!["ig-phd.legacy".to_string()]);
}

#[tokio::test]
async fn test_routes_on_device_manufacturer() {
    let settings = r#"
[[senders]]
name = "fhir"
organization = "lab"
topic = "covid-19"
format = "FHIR"

[[receivers]]
name = "abbott"
organization = "devices"
topic = "covid-19"
jurisdictional_filter = ["Bundle.entry.resource.ofType(Observation).where(livdTableLookup('Manufacturer') = 'Abbott').exists()"]

[[receivers]]
name = "quidel"
organization = "devices"
topic = "covid-19"
jurisdictional_filter = ["Bundle.entry.resource.ofType(Observation).where(livdTableLookup('Manufacturer') = 'Quidel').exists()"]
"#;
    let harness = Harness::with_settings(settings);
    let bundle = json!({
        "resourceType": "Bundle",
        "type": "message",
        "identifier": {"value": "MSG-901"},
        "entry": [
            {"resource": {"resourceType": "MessageHeader", "id": "MSG-901"}},
            {"fullUrl": "Device/dev-1", "resource": {
                "resourceType": "Device", "id": "dev-1",
                "identifier": [{"value": "BinaxNOW-Reader"}]
            }},
            {"resource": {
                "resourceType": "Observation", "id": "obs-1",
                "code": {"coding": [{"system": "http://loinc.org", "code": "94558-4"}]},
                "device": {"reference": "Device/dev-1"}
            }}
        ]
    })
    .to_string();
    harness
        .submit(bundle.as_bytes(), MimeFormat::Fhir, "lab.fhir")
        .await;

    let p = &harness.pipeline;
    StageRunner::new(ReceiveStage::new(p.clone()), p.clone())
        .process_batch(10)
        .await
        .unwrap();
    StageRunner::new(ConvertStage::new(p.clone()), p.clone())
        .process_batch(10)
        .await
        .unwrap();
    StageRunner::new(DestinationFilterStage::new(p.clone()), p.clone())
        .process_batch(10)
        .await
        .unwrap();

    let routed = harness.queued(queues::RECEIVER_FILTER).await;
    assert_eq!(routed.len(), 1);
    assert_eq!(routed[0].receiver_full_name(), Some("devices.abbott"));
}

#[tokio::test]
async fn test_hl7_submission_is_delivered() {
    let harness = Harness::new();
    let root = harness
        .submit(HL7_MESSAGE.as_bytes(), MimeFormat::Hl7, "lab.hl7")
        .await;
    harness.drain().await;

    let deliveries = harness.transport.deliveries().await;
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].receiver, "ig-phd.elr");
    let bundle: serde_json::Value = serde_json::from_slice(&deliveries[0].body).unwrap();
    assert_eq!(bundle["identifier"]["value"], "MSG-042");

    for queue in queues::ALL {
        assert_eq!(harness.stores.queue.depth(queue).await.unwrap(), 0, "{queue}");
    }
    let lineage = &harness.stores.lineage;
    let actions = lineage.actions_for(root).await.unwrap();
    assert_eq!(actions.len(), 2);
    assert!(actions.iter().all(|a| a.outcome == ActionOutcome::Success));
    assert!(actions.iter().any(|a| a.action == TaskAction::Convert));
}

#[tokio::test]
async fn test_every_report_traces_back_to_its_root() {
    let harness = Harness::new();
    let root = harness
        .submit(HL7_MESSAGE.as_bytes(), MimeFormat::Hl7, "lab.hl7")
        .await;
    harness.drain().await;

    let lineage = &harness.stores.lineage;
    let reports = lineage.reports();
    // root, item, receiver copy, filtered, translated, batched, sent
    assert_eq!(reports.len(), 7);
    for report in reports {
        assert_eq!(lineage.root_of(report.id).await.unwrap(), root);
    }
    assert!(lineage.parents_of(root).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_redelivered_message_yields_identical_digests() {
    let harness = Harness::new();
    harness
        .submit(HL7_MESSAGE.as_bytes(), MimeFormat::Hl7, "lab.hl7")
        .await;
    let p = &harness.pipeline;
    StageRunner::new(ReceiveStage::new(p.clone()), p.clone())
        .process_batch(10)
        .await
        .unwrap();

    // simulate a redelivery of the convert message
    let convert = harness.queued(queues::CONVERT).await;
    harness.enqueue(&convert[0]).await;
    StageRunner::new(ConvertStage::new(p.clone()), p.clone())
        .process_batch(10)
        .await
        .unwrap();

    let outputs = harness.queued(queues::DESTINATION_FILTER).await;
    assert_eq!(outputs.len(), 2);
    let (first_url, first_digest) = outputs[0].blob_ref().unwrap();
    let (second_url, second_digest) = outputs[1].blob_ref().unwrap();
    assert_eq!(first_digest, second_digest);
    assert_ne!(first_url, second_url);
    assert_ne!(outputs[0].report_id(), outputs[1].report_id());
}

#[tokio::test]
async fn test_corrupted_submission_is_rejected_before_conversion() {
    let harness = Harness::new();
    let root = harness
        .submit(ig_bundle().as_bytes(), MimeFormat::Fhir, "lab.fhir")
        .await;
    let message = &harness.queued(queues::RECEIVE).await[0];
    let (url, _) = message.blob_ref().unwrap();
    harness.stores.blobs.overwrite(url, b"{\"resourceType\":\"Bundle\"}".to_vec());

    harness.drain().await;

    assert!(harness.transport.deliveries().await.is_empty());
    assert_eq!(harness.stores.lineage.report_count(), 0);
    let actions = harness.stores.lineage.actions_for(root).await.unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].outcome, ActionOutcome::Rejected);
    assert_eq!(actions[0].action, TaskAction::Receive);
}

#[tokio::test]
async fn test_events_serialize_with_their_name() {
    let harness = Harness::new();
    let mut events = harness.pipeline.events.subscribe();
    harness
        .submit(ig_bundle().as_bytes(), MimeFormat::Fhir, "lab.fhir")
        .await;
    harness.drain().await;

    let events = collect_events(&mut events);
    let names: Vec<&str> = events.iter().map(PipelineEvent::name).collect();
    assert_eq!(
        names,
        vec!["report_received", "item_not_routed", "item_routed", "report_sent"]
    );
    let value = serde_json::to_value(&events[0]).unwrap();
    assert_eq!(value["event"], "report_received");
    assert_eq!(value["sender"], "lab.fhir");
}
