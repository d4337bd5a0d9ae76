//! Collaborator interfaces for the remote text, speech and document services.
//!
//! The engine never reaches a service through global state: hosts inject an
//! implementation of each trait, and tests substitute fakes. Responses that
//! must be structured (flashcards, pronunciation guides, insights) are JSON
//! arrays parsed by [`parse_records`].

use std::path::Path;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SadaError};

/// Length and shape of a requested summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryKind {
    Short,
    #[default]
    Medium,
    Detailed,
    Points,
}

impl SummaryKind {
    fn instruction(self) -> &'static str {
        match self {
            SummaryKind::Short => "Summarize the text briefly in one short, clear paragraph.",
            SummaryKind::Medium => {
                "Summarize the text at medium length, covering the main points in at most two paragraphs."
            }
            SummaryKind::Detailed => {
                "Summarize the text in detail, explaining the main ideas and the important specifics."
            }
            SummaryKind::Points => "Summarize the text as a complete bullet list of its key points.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flashcard {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PronunciationEntry {
    pub word: String,
    pub pronunciation: String,
    pub note: String,
}

/// One request to the remote text service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRequest {
    /// System instruction describing the task.
    pub instruction: String,
    /// User content the task applies to.
    pub content: String,
    /// Ask for a JSON response body.
    pub json: bool,
}

/// Remote generative text service.
pub trait TextService: Send + Sync {
    /// Run one request and return the raw response text.
    fn generate(&self, request: &TextRequest) -> Result<String>;
}

/// Remote text-to-speech.
pub trait SpeechSynthesizer: Send + Sync {
    /// Base64 PCM16 mono audio at 24 kHz.
    fn synthesize(&self, text: &str) -> Result<String>;
}

/// Turns an uploaded document into plain text.
pub trait DocumentExtractor: Send + Sync {
    fn extract(&self, file_name: &str, bytes: &[u8]) -> Result<String>;
}

/// Parse a JSON array of records returned by the text service.
///
/// # Errors
/// `EmptyResponse` for blank text, `InvalidFormat` for anything that is not a
/// JSON array of `T`.
pub fn parse_records<T: DeserializeOwned>(text: &str) -> Result<Vec<T>> {
    let text = text.trim();
    if text.is_empty() {
        return Err(SadaError::EmptyResponse);
    }
    serde_json::from_str(text).map_err(|e| {
        warn!("unparseable structured response: {e}");
        SadaError::InvalidFormat(e.to_string())
    })
}

fn non_empty(text: String) -> Result<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(SadaError::EmptyResponse);
    }
    Ok(trimmed.to_string())
}

pub fn summarize(service: &dyn TextService, text: &str, kind: SummaryKind) -> Result<String> {
    non_empty(service.generate(&TextRequest {
        instruction: kind.instruction().into(),
        content: format!("Text to summarize:\n\n{text}"),
        json: false,
    })?)
}

pub fn translate(service: &dyn TextService, text: &str, language: &str) -> Result<String> {
    non_empty(service.generate(&TextRequest {
        instruction: format!(
            "You are an expert translator. Translate the provided text into {language}. \
             Respond with ONLY the translated text."
        ),
        content: text.into(),
        json: false,
    })?)
}

pub fn flashcards(service: &dyn TextService, text: &str) -> Result<Vec<Flashcard>> {
    let response = service.generate(&TextRequest {
        instruction: "Generate 5-8 question and answer pairs that test the key concepts of the \
                      text. Respond with a JSON array of {\"question\", \"answer\"} objects."
            .into(),
        content: text.into(),
        json: true,
    })?;
    parse_records(&response)
}

pub fn pronunciation_guide(service: &dyn TextService, text: &str) -> Result<Vec<PronunciationEntry>> {
    let response = service.generate(&TextRequest {
        instruction: "Identify complex or technical words in the text. For each, give the word, a \
                      pronunciation guide and a brief note. Respond with a JSON array of \
                      {\"word\", \"pronunciation\", \"note\"} objects."
            .into(),
        content: text.into(),
        json: true,
    })?;
    parse_records(&response)
}

pub fn key_insights(service: &dyn TextService, text: &str) -> Result<Vec<String>> {
    let response = service.generate(&TextRequest {
        instruction: "List the key insights of the text. Respond with a JSON array of strings."
            .into(),
        content: text.into(),
        json: true,
    })?;
    parse_records(&response)
}

/// Answer a question about `context`.
pub fn ask(service: &dyn TextService, context: &str, question: &str) -> Result<String> {
    non_empty(service.generate(&TextRequest {
        instruction: format!(
            "Answer the user's question using the following context.\n---\n{context}\n---"
        ),
        content: question.into(),
        json: false,
    })?)
}

/// Kinds of document the extraction service accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Image,
    PlainText,
}

impl DocumentKind {
    /// Classify by file extension.
    ///
    /// # Errors
    /// `UnsupportedFileType` for unknown or missing extensions.
    pub fn from_file_name(file_name: &str) -> Result<Self> {
        let ext = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "pdf" => Ok(DocumentKind::Pdf),
            "png" | "jpg" | "jpeg" | "webp" | "gif" => Ok(DocumentKind::Image),
            "txt" | "md" => Ok(DocumentKind::PlainText),
            _ => Err(SadaError::UnsupportedFileType(file_name.into())),
        }
    }
}

/// Extractor for plain text uploads; PDFs and images need a remote extractor.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextExtractor;

impl DocumentExtractor for PlainTextExtractor {
    fn extract(&self, file_name: &str, bytes: &[u8]) -> Result<String> {
        match DocumentKind::from_file_name(file_name)? {
            DocumentKind::PlainText => std::str::from_utf8(bytes)
                .map(|s| s.trim().to_string())
                .map_err(|e| SadaError::ExtractionFailed(format!("{file_name}: {e}"))),
            _ => Err(SadaError::UnsupportedFileType(file_name.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct CannedService {
        reply: String,
        seen: Mutex<Vec<TextRequest>>,
    }

    impl CannedService {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.into(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl TextService for CannedService {
        fn generate(&self, request: &TextRequest) -> Result<String> {
            self.seen.lock().push(request.clone());
            Ok(self.reply.clone())
        }
    }

    #[test]
    fn flashcards_parse_from_json_array() {
        let service = CannedService::new(r#"[{"question":"Q1","answer":"A1"}]"#);
        let cards = flashcards(&service, "notes").unwrap();
        assert_eq!(
            cards,
            vec![Flashcard {
                question: "Q1".into(),
                answer: "A1".into()
            }]
        );
        assert!(service.seen.lock()[0].json);
    }

    #[test]
    fn blank_and_malformed_responses_are_distinct() {
        assert!(matches!(
            pronunciation_guide(&CannedService::new("  \n"), "x"),
            Err(SadaError::EmptyResponse)
        ));
        assert!(matches!(
            key_insights(&CannedService::new("not json"), "x"),
            Err(SadaError::InvalidFormat(_))
        ));
        assert!(matches!(
            parse_records::<Flashcard>(r#"[{"question":"only"}]"#),
            Err(SadaError::InvalidFormat(_))
        ));
    }

    #[test]
    fn summary_is_trimmed_and_uses_kind_instruction() {
        let service = CannedService::new("  summary  ");
        assert_eq!(summarize(&service, "text", SummaryKind::Points).unwrap(), "summary");
        assert!(service.seen.lock()[0].instruction.contains("bullet"));
        assert!(matches!(
            summarize(&CannedService::new(""), "text", SummaryKind::Short),
            Err(SadaError::EmptyResponse)
        ));
    }

    #[test]
    fn translate_names_target_language() {
        let service = CannedService::new("\n Bonjour \n");
        assert_eq!(translate(&service, "Hello", "French").unwrap(), "Bonjour");
        let request = &service.seen.lock()[0];
        assert!(request.instruction.contains("into French"));
        assert!(request.instruction.contains("Respond with ONLY"));
        assert_eq!(request.content, "Hello");
        assert!(!request.json);
    }

    #[test]
    fn ask_grounds_question_in_context() {
        let service = CannedService::new(" Mitochondria. ");
        let answer = ask(&service, "cells have mitochondria", "What powers cells?").unwrap();
        assert_eq!(answer, "Mitochondria.");
        let request = &service.seen.lock()[0];
        assert!(request.instruction.contains("---\ncells have mitochondria\n---"));
        assert_eq!(request.content, "What powers cells?");
        assert!(matches!(
            ask(&CannedService::new("   "), "ctx", "q"),
            Err(SadaError::EmptyResponse)
        ));
    }

    #[test]
    fn document_kinds_by_extension() {
        assert_eq!(DocumentKind::from_file_name("a.PDF").unwrap(), DocumentKind::Pdf);
        assert_eq!(DocumentKind::from_file_name("scan.jpeg").unwrap(), DocumentKind::Image);
        assert!(matches!(
            DocumentKind::from_file_name("archive.zip"),
            Err(SadaError::UnsupportedFileType(_))
        ));
        assert!(DocumentKind::from_file_name("README").is_err());
    }

    #[test]
    fn plain_text_extractor() {
        let extractor = PlainTextExtractor;
        assert_eq!(extractor.extract("n.txt", b" hello \n").unwrap(), "hello");
        assert!(matches!(
            extractor.extract("n.txt", &[0xff, 0xfe]),
            Err(SadaError::ExtractionFailed(_))
        ));
        assert!(matches!(
            extractor.extract("n.pdf", b"%PDF"),
            Err(SadaError::UnsupportedFileType(_))
        ));
    }
}
