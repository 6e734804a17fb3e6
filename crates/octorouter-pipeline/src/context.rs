//! Shared services handed to every stage.

use std::sync::Arc;
use std::time::Duration;

use octorouter_core::EventBroadcaster;
use octorouter_lookup::TableRegistry;
use octorouter_storage::{DynBlobStore, DynLineageStore, DynWorkQueue};

use crate::filters::FilterEngine;
use crate::hl7::{BasicHl7Transcoder, Hl7Transcoder};
use crate::settings::SettingsProvider;
use crate::stage::send::{LoggingTransport, Transport};
use crate::stage::translate::Translators;

pub const DEFAULT_SHORTHAND_TABLE: &str = "fhirpath_filter_shorthand";
pub const DEFAULT_OBSERVATION_MAPPING_TABLE: &str = "observation-mapping";

/// Tunables shared by the stage runners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub poll_interval: Duration,
    /// Messages leased per poll.
    pub batch_size: usize,
    pub visibility_timeout: Duration,
    /// Deliveries beyond this count go to the poison queue.
    pub max_dequeue_count: u32,
    pub max_message_bytes: usize,
    pub stage_timeout: Duration,
    pub shorthand_table: String,
    pub observation_mapping_table: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 16,
            visibility_timeout: Duration::from_secs(300),
            max_dequeue_count: 5,
            max_message_bytes: 64 * 1024,
            stage_timeout: Duration::from_secs(60),
            shorthand_table: DEFAULT_SHORTHAND_TABLE.to_string(),
            observation_mapping_table: DEFAULT_OBSERVATION_MAPPING_TABLE.to_string(),
        }
    }
}

/// Storage, configuration and collaborators used by the stages.
#[derive(Clone)]
pub struct PipelineContext {
    pub blobs: DynBlobStore,
    pub queue: DynWorkQueue,
    pub lineage: DynLineageStore,
    pub settings: Arc<dyn SettingsProvider>,
    pub tables: Arc<TableRegistry>,
    pub events: Arc<EventBroadcaster>,
    pub filters: FilterEngine,
    pub transcoder: Arc<dyn Hl7Transcoder>,
    pub translators: Translators,
    pub transport: Arc<dyn Transport>,
    pub config: PipelineSettings,
}

impl PipelineContext {
    /// A context with default collaborators: the basic HL7 transcoder, an
    /// empty table registry, filters without shorthands and a transport that
    /// only logs.
    pub fn new(
        blobs: DynBlobStore,
        queue: DynWorkQueue,
        lineage: DynLineageStore,
        settings: Arc<dyn SettingsProvider>,
    ) -> Self {
        let transcoder: Arc<dyn Hl7Transcoder> = Arc::new(BasicHl7Transcoder);
        Self {
            blobs,
            queue,
            lineage,
            settings,
            tables: TableRegistry::new_shared(),
            events: EventBroadcaster::new_shared(),
            filters: FilterEngine::default(),
            translators: Translators::with_transcoder(Arc::clone(&transcoder)),
            transcoder,
            transport: Arc::new(LoggingTransport),
            config: PipelineSettings::default(),
        }
    }

    pub fn with_tables(mut self, tables: Arc<TableRegistry>) -> Self {
        self.tables = tables;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBroadcaster>) -> Self {
        self.events = events;
        self
    }

    pub fn with_filters(mut self, filters: FilterEngine) -> Self {
        self.filters = filters;
        self
    }

    /// Replaces the transcoder and the HL7 translator built on it.
    pub fn with_transcoder(mut self, transcoder: Arc<dyn Hl7Transcoder>) -> Self {
        self.translators = Translators::with_transcoder(Arc::clone(&transcoder));
        self.transcoder = transcoder;
        self
    }

    pub fn with_translators(mut self, translators: Translators) -> Self {
        self.translators = translators;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_config(mut self, config: PipelineSettings) -> Self {
        self.config = config;
        self
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("tables", &self.tables.names())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
