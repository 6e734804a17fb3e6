//! Translate: renders a receiver's bundle in the format the receiver wants.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use octorouter_core::{Digest, MimeFormat, Report, TaskAction};
use octorouter_storage::BlobFolder;
use serde_json::Value;

use super::destination_filter::parse_bundle;
use super::{Stage, StageContext, StageOutput, download_verified, emit, sender_of, unexpected};
use crate::bundle::tracking_id;
use crate::context::PipelineContext;
use crate::error::{PipelineError, PipelineResult};
use crate::hl7::Hl7Transcoder;
use crate::message::{BatchMessage, QueueMessage};
use crate::settings::Receiver;

/// Turns a canonical bundle into a receiver's wire format.
pub trait Translator: Send + Sync {
    fn format(&self) -> MimeFormat;

    /// # Errors
    ///
    /// Returns `PipelineError::Conversion` if the bundle cannot be expressed
    /// in the target format.
    fn translate(&self, bundle: &Value, receiver: &Receiver) -> PipelineResult<Vec<u8>>;
}

/// Writes the bundle back out unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct FhirPassthroughTranslator;

impl Translator for FhirPassthroughTranslator {
    fn format(&self) -> MimeFormat {
        MimeFormat::Fhir
    }

    fn translate(&self, bundle: &Value, _receiver: &Receiver) -> PipelineResult<Vec<u8>> {
        Ok(serde_json::to_vec(bundle)?)
    }
}

/// Encodes the bundle as an HL7 v2 message.
pub struct Hl7Translator {
    transcoder: Arc<dyn Hl7Transcoder>,
}

impl Hl7Translator {
    pub fn new(transcoder: Arc<dyn Hl7Transcoder>) -> Self {
        Self { transcoder }
    }
}

impl Translator for Hl7Translator {
    fn format(&self) -> MimeFormat {
        MimeFormat::Hl7
    }

    fn translate(&self, bundle: &Value, _receiver: &Receiver) -> PipelineResult<Vec<u8>> {
        Ok(self.transcoder.encode(bundle)?.into_bytes())
    }
}

/// Translators keyed by the format they produce.
#[derive(Clone, Default)]
pub struct Translators {
    by_format: HashMap<MimeFormat, Arc<dyn Translator>>,
}

impl Translators {
    /// FHIR passthrough plus HL7 through `transcoder`.
    pub fn with_transcoder(transcoder: Arc<dyn Hl7Transcoder>) -> Self {
        Self::default()
            .register(Arc::new(FhirPassthroughTranslator))
            .register(Arc::new(Hl7Translator::new(transcoder)))
    }

    /// Adds or replaces the translator for its format.
    pub fn register(mut self, translator: Arc<dyn Translator>) -> Self {
        self.by_format.insert(translator.format(), translator);
        self
    }

    /// # Errors
    ///
    /// Returns `PipelineError::Configuration` if no translator produces `format`.
    pub fn for_format(&self, format: MimeFormat) -> PipelineResult<Arc<dyn Translator>> {
        self.by_format.get(&format).cloned().ok_or_else(|| {
            PipelineError::configuration(format!("no translator produces {format}"))
        })
    }
}

impl fmt::Debug for Translators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Translators")
            .field("formats", &self.by_format.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub struct TranslateStage {
    pipeline: Arc<PipelineContext>,
}

impl TranslateStage {
    pub fn new(pipeline: Arc<PipelineContext>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Stage for TranslateStage {
    fn name(&self) -> &'static str {
        "translate"
    }

    fn action(&self) -> TaskAction {
        TaskAction::Translate
    }

    async fn process(
        &self,
        message: &QueueMessage,
        _ctx: &mut StageContext,
    ) -> PipelineResult<Vec<StageOutput>> {
        let QueueMessage::Translate(message) = message else {
            return Err(unexpected(self.action(), message));
        };
        let pipeline = &self.pipeline;

        let receiver = pipeline
            .settings
            .find_receiver(&message.receiver_full_name)
            .ok_or_else(|| PipelineError::not_found("receiver", &message.receiver_full_name))?;
        let translator = pipeline.translators.for_format(receiver.format)?;

        let bytes = download_verified(pipeline, &message.blob_url, &message.digest).await?;
        let bundle = parse_bundle(&bytes)?;
        let translated = translator.translate(&bundle, &receiver)?;

        let mut child = Report::new(receiver.format, message.topic.clone(), TaskAction::Batch)
            .with_receiver(message.receiver_full_name.clone())
            .with_parent(
                message.report_id,
                1,
                Digest::of(&translated),
                tracking_id(&bundle),
            );
        child.sender = sender_of(pipeline, message.report_id).await?;

        let receiver_full_name = message.receiver_full_name.clone();
        let output = emit(
            pipeline,
            child,
            &translated,
            BlobFolder::Translate,
            message.blob_subfolder.as_deref(),
            move |report, _| {
                Some(QueueMessage::Batch(BatchMessage {
                    report_id: report.id,
                    receiver_full_name,
                }))
            },
        )
        .await?;
        tracing::debug!(
            report_id = %output.report.id,
            receiver = %message.receiver_full_name,
            format = %receiver.format,
            "Translated report"
        );
        Ok(vec![output])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hl7::BasicHl7Transcoder;
    use crate::test_support::{TestPipeline, sample_bundle};
    use octorouter_storage::BlobStore;

    const SETTINGS: &str = r#"
[[receivers]]
name = "fhir"
organization = "ig-phd"
topic = "covid-19"

[[receivers]]
name = "hl7"
organization = "ig-phd"
topic = "covid-19"
format = "HL7"

[[receivers]]
name = "csv"
organization = "ig-phd"
topic = "covid-19"
format = "CSV"
"#;

    async fn translate_message(test: &TestPipeline, receiver: &str) -> QueueMessage {
        let QueueMessage::ReceiverFilter(message) = test
            .receiver_filter_message(&sample_bundle("IG"), receiver)
            .await
        else {
            unreachable!()
        };
        QueueMessage::Translate(message)
    }

    async fn body(test: &TestPipeline, output: &StageOutput) -> Vec<u8> {
        test.stores
            .blobs
            .download(output.report.body_url.as_ref().unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_fhir_receiver_gets_bundle_unchanged() {
        let test = TestPipeline::with_settings(SETTINGS);
        let message = translate_message(&test, "ig-phd.fhir").await;
        let stage = TranslateStage::new(test.pipeline.clone());
        let outputs = stage.process(&message, &mut StageContext::new()).await.unwrap();

        let output = &outputs[0];
        assert_eq!(output.report.format, MimeFormat::Fhir);
        let translated: Value = serde_json::from_slice(&body(&test, output).await).unwrap();
        assert_eq!(translated, sample_bundle("IG"));
        assert!(matches!(
            &output.next,
            Some(QueueMessage::Batch(next)) if next.receiver_full_name == "ig-phd.fhir"
        ));
    }

    #[tokio::test]
    async fn test_hl7_receiver_gets_hl7() {
        let test = TestPipeline::with_settings(SETTINGS);
        let message = translate_message(&test, "ig-phd.hl7").await;
        let stage = TranslateStage::new(test.pipeline.clone());
        let outputs = stage.process(&message, &mut StageContext::new()).await.unwrap();

        let output = &outputs[0];
        assert_eq!(output.report.format, MimeFormat::Hl7);
        assert!(output.report.body_url.as_ref().unwrap().path().ends_with(".hl7"));
        let text = String::from_utf8(body(&test, output).await).unwrap();
        assert!(text.starts_with("MSH|^~\\&|"));
        assert!(text.contains("|MSG-100|P|"));
        assert_eq!(text.matches("\rOBX|").count(), 2);
    }

    #[tokio::test]
    async fn test_missing_translator_is_configuration_error() {
        let test = TestPipeline::with_settings(SETTINGS);
        let message = translate_message(&test, "ig-phd.csv").await;
        let stage = TranslateStage::new(test.pipeline.clone());
        let err = stage
            .process(&message, &mut StageContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration { .. }));
    }

    #[test]
    fn test_register_replaces_by_format() {
        let translators = Translators::with_transcoder(Arc::new(BasicHl7Transcoder));
        assert!(translators.for_format(MimeFormat::Hl7).is_ok());
        assert!(translators.for_format(MimeFormat::Csv).is_err());
        let translators = translators.register(Arc::new(FhirPassthroughTranslator));
        assert_eq!(
            translators.for_format(MimeFormat::Fhir).unwrap().format(),
            MimeFormat::Fhir
        );
    }
}
