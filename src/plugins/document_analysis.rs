//! Document upload and analysis.
//!
//! Documents arrive base64-encoded, are identified by a content hash and
//! bound to the uploading session. Analysis runs as a background job: text
//! extraction (pdf via lopdf, plain-text formats directly), deterministic
//! extractive summarization and keyword-overlap question answering. A
//! stored document can be re-analyzed by id without re-sending its bytes.
//! A second analysis request for a document whose job is still in flight is
//! rejected with a conflict before any job is started.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::ToolError;
use crate::executor::{JobKind, JobSpec};
use crate::plugins::{opt_str, require_str};
use crate::registry::{
    FunctionSpec, Invocation, InvokeContext, ParamSpec, ParamType, Plugin, PluginDescriptor,
};
use crate::session::{AnalysisType, QaPair};

/// Extraction output cap; enough for model context without flooding it.
const EXTRACT_LIMIT: usize = 2000;

const SUMMARY_SENTENCES: usize = 3;

const PARSEABLE: &[&str] = &["pdf", "txt", "md", "markdown", "csv", "log", "json"];

pub struct DocumentAnalysisPlugin;

#[async_trait]
impl Plugin for DocumentAnalysisPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            name: "document_analysis",
            description: "Extracts, summarizes and answers questions about uploaded documents",
            functions: vec![
                FunctionSpec {
                    name: "analyze_document",
                    description: "Analyze a document. Give filename and file_data to upload, or \
                                  document_id to re-analyze a stored document. Runs in the \
                                  background; the result arrives as a document_analysis_result \
                                  event.",
                    params: vec![
                        ParamSpec::optional(
                            "filename",
                            ParamType::String,
                            "Name of the uploaded file; required with file_data",
                        ),
                        ParamSpec::optional(
                            "file_data",
                            ParamType::String,
                            "File content, base64-encoded",
                        ),
                        ParamSpec::optional(
                            "document_id",
                            ParamType::String,
                            "Id of an already-uploaded document to re-analyze",
                        ),
                        ParamSpec::optional(
                            "analysis_type",
                            ParamType::String,
                            "What to do with the document",
                        )
                        .with_default(json!("extract"))
                        .with_one_of(vec!["extract", "summarize", "qa"]),
                        ParamSpec::optional(
                            "question",
                            ParamType::String,
                            "Question to answer; required for qa analysis",
                        ),
                    ],
                },
                FunctionSpec {
                    name: "list_documents",
                    description: "List the documents stored in this session",
                    params: vec![],
                },
            ],
        }
    }

    async fn invoke(
        &self,
        ctx: &InvokeContext,
        function: &str,
        args: Map<String, Value>,
    ) -> Result<Invocation, ToolError> {
        match function {
            "analyze_document" => self.analyze(ctx, args).await,
            "list_documents" => {
                let session = ctx.sessions.get(ctx.session_id)?;
                let documents: Vec<Value> = session
                    .list_documents()
                    .await
                    .iter()
                    .map(|doc| {
                        json!({
                            "document_id": doc.document_id,
                            "filename": doc.filename,
                            "content_length": doc.content.len(),
                            "analysis_type": doc.analysis_type.as_str(),
                            "analyzing": doc.active_job.is_some(),
                        })
                    })
                    .collect();
                Ok(Invocation::Immediate(json!({
                    "count": documents.len(),
                    "documents": documents,
                })))
            }
            other => Err(ToolError::UnknownFunction(other.to_string())),
        }
    }
}

impl DocumentAnalysisPlugin {
    async fn analyze(
        &self,
        ctx: &InvokeContext,
        args: Map<String, Value>,
    ) -> Result<Invocation, ToolError> {
        let analysis_type = match opt_str(&args, "analysis_type").unwrap_or("extract") {
            "extract" => AnalysisType::Extract,
            "summarize" => AnalysisType::Summarize,
            "qa" => AnalysisType::Qa,
            other => {
                return Err(ToolError::invalid_argument(
                    "analysis_type",
                    format!("unknown analysis type '{other}'"),
                ))
            }
        };
        let question = opt_str(&args, "question").map(str::to_string);
        if analysis_type == AnalysisType::Qa && question.is_none() {
            return Err(ToolError::invalid_argument(
                "question",
                "required for qa analysis",
            ));
        }

        let session = ctx.sessions.get(ctx.session_id)?;
        let (document_id, filename, content) = match (
            opt_str(&args, "file_data"),
            opt_str(&args, "document_id"),
        ) {
            (Some(_), Some(_)) => {
                return Err(ToolError::invalid_argument(
                    "document_id",
                    "give file_data for an upload or document_id for a stored document, not both",
                ))
            }
            (Some(data), None) => {
                let filename = require_str(&args, "filename")?.to_string();
                let content = BASE64
                    .decode(data)
                    .map_err(|_| ToolError::invalid_argument("file_data", "invalid base64"))?;
                let extension = file_extension(&filename);
                if !PARSEABLE.contains(&extension.as_str()) {
                    return Err(ToolError::Unavailable(format!(
                        "no parser for '.{extension}' files"
                    )));
                }
                let document_id = hex_digest(&content);
                session
                    .begin_analysis(&document_id, &filename, &content, analysis_type, ctx.job_id)
                    .await?;
                (document_id, filename, content)
            }
            (None, Some(id)) => {
                let doc = session
                    .begin_reanalysis(id, analysis_type, ctx.job_id)
                    .await?;
                (doc.document_id, doc.filename, doc.content)
            }
            (None, None) => {
                return Err(ToolError::invalid_argument(
                    "file_data",
                    "either file_data or document_id is required",
                ))
            }
        };
        let extension = file_extension(&filename);
        debug!(document_id = %document_id, filename = %filename, analysis_type = analysis_type.as_str(), "analysis queued");

        let sessions = ctx.sessions.clone();
        let session_id = ctx.session_id;
        Ok(Invocation::Deferred(JobSpec {
            kind: JobKind::DocumentAnalysis,
            event_prefix: "document_analysis",
            document_id: Some(document_id.clone()),
            store_artifact: false,
            run: Box::new(move |job| {
                Box::pin(async move {
                    job.report_progress(5);
                    let text = extract_text(&extension, &content, |done, total| {
                        job.report_progress(5 + (done * 55 / total.max(1)) as u8);
                    })?;
                    job.checkpoint()?;
                    job.report_progress(60);

                    let content_length = content.len();
                    let mut result = json!({
                        "document_id": document_id,
                        "filename": filename,
                        "analysis_type": analysis_type.as_str(),
                        "content_length": content_length,
                    });

                    let (extracted, summary, qa) = match analysis_type {
                        AnalysisType::Extract => {
                            let (excerpt, truncated) = truncate_chars(&text, EXTRACT_LIMIT);
                            result["extracted_content"] = json!(&excerpt);
                            result["truncated"] = json!(truncated);
                            (Some(excerpt), None, None)
                        }
                        AnalysisType::Summarize => {
                            let summary = summarize(&text, SUMMARY_SENTENCES);
                            result["summary"] = json!(&summary);
                            (None, Some(summary), None)
                        }
                        AnalysisType::Qa => {
                            // Presence checked at invoke time.
                            let question = question.unwrap_or_default();
                            let answer = answer_question(&text, &question);
                            result["question"] = json!(&question);
                            result["answer"] = json!(&answer);
                            (None, None, Some(QaPair { question, answer }))
                        }
                    };
                    job.checkpoint()?;
                    job.report_progress(90);

                    if let Ok(session) = sessions.get(session_id) {
                        session
                            .store_analysis(&document_id, extracted, summary, qa)
                            .await;
                    }
                    job.report_progress(100);
                    Ok(result)
                })
            }),
        }))
    }
}

pub(crate) fn hex_digest(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn file_extension(filename: &str) -> String {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Pull plain text out of the raw bytes. `progress` is called per parsing
/// unit (pdf pages); plain-text formats report once.
fn extract_text(
    extension: &str,
    content: &[u8],
    progress: impl Fn(u32, u32),
) -> Result<String, ToolError> {
    match extension {
        "pdf" => {
            let doc = lopdf::Document::load_mem(content)
                .map_err(|e| ToolError::invalid_argument("file_data", format!("not a valid pdf: {e}")))?;
            let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
            let total = pages.len() as u32;
            let mut text = String::new();
            for (i, page) in pages.iter().enumerate() {
                match doc.extract_text(&[*page]) {
                    Ok(page_text) => {
                        text.push_str(&page_text);
                        text.push('\n');
                    }
                    Err(e) => debug!(page, error = %e, "skipping unextractable page"),
                }
                progress(i as u32 + 1, total);
            }
            Ok(text)
        }
        _ => {
            progress(1, 1);
            Ok(String::from_utf8_lossy(content).into_owned())
        }
    }
}

fn truncate_chars(text: &str, limit: usize) -> (String, bool) {
    let trimmed = text.trim();
    if trimmed.chars().count() <= limit {
        (trimmed.to_string(), false)
    } else {
        (trimmed.chars().take(limit).collect(), true)
    }
}

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "can", "had", "her", "was", "one",
    "our", "out", "has", "have", "this", "that", "with", "they", "from", "been", "were", "will",
    "would", "there", "their", "what", "which", "when", "into", "than", "then", "them", "these",
    "some", "such", "also", "more", "most", "other", "about",
];

fn split_sentences(text: &str) -> Vec<String> {
    text.split_inclusive(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| s.chars().filter(|c| c.is_alphanumeric()).count() >= 10)
        .map(str::to_string)
        .collect()
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3)
        .map(str::to_lowercase)
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
}

fn word_frequencies(text: &str) -> HashMap<String, usize> {
    let mut freq = HashMap::new();
    for word in tokenize(text) {
        *freq.entry(word).or_insert(0) += 1;
    }
    freq
}

/// Extractive summary: score each sentence by the frequency of its words
/// across the whole document and keep the top scorers in original order.
/// Pure function of the input, so repeated requests agree.
pub(crate) fn summarize(text: &str, max_sentences: usize) -> String {
    let sentences = split_sentences(text);
    if sentences.len() <= max_sentences {
        return sentences.join(" ");
    }
    let freq = word_frequencies(text);

    let mut scored: Vec<(usize, usize)> = sentences
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let score: usize = tokenize(s).map(|w| freq.get(&w).copied().unwrap_or(0)).sum();
            (i, score)
        })
        .collect();
    scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let mut keep: Vec<usize> = scored.iter().take(max_sentences).map(|(i, _)| *i).collect();
    keep.sort_unstable();

    keep.iter()
        .map(|&i| sentences[i].as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Best-overlap answer: the sentence sharing the most keywords with the
/// question.
pub(crate) fn answer_question(text: &str, question: &str) -> String {
    let keywords: Vec<String> = tokenize(question).collect();
    if keywords.is_empty() {
        return "No relevant passage found.".to_string();
    }
    let best = split_sentences(text)
        .into_iter()
        .map(|s| {
            let words: Vec<String> = tokenize(&s).collect();
            let overlap = keywords.iter().filter(|k| words.contains(k)).count();
            (s, overlap)
        })
        .filter(|(_, overlap)| *overlap > 0)
        .max_by_key(|(_, overlap)| *overlap);
    match best {
        Some((sentence, _)) => sentence,
        None => "No relevant passage found.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    const SAMPLE: &str = "The reactor design uses passive cooling throughout. \
        Passive cooling removes decay heat without pumps. \
        The control room is staffed around the clock. \
        Pumps are still installed for maintenance flushing. \
        Decay heat falls off within days of shutdown.";

    #[test]
    fn digest_is_stable_per_content() {
        assert_eq!(hex_digest(b"abc"), hex_digest(b"abc"));
        assert_ne!(hex_digest(b"abc"), hex_digest(b"abd"));
        assert_eq!(hex_digest(b"abc").len(), 64);
    }

    #[test]
    fn extension_detection() {
        assert_eq!(file_extension("report.PDF"), "pdf");
        assert_eq!(file_extension("notes.tar.gz"), "gz");
        assert_eq!(file_extension("README"), "");
    }

    #[test]
    fn extract_truncates_at_limit() {
        let long = "x".repeat(EXTRACT_LIMIT + 50);
        let (excerpt, truncated) = truncate_chars(&long, EXTRACT_LIMIT);
        assert!(truncated);
        assert_eq!(excerpt.chars().count(), EXTRACT_LIMIT);

        let (excerpt, truncated) = truncate_chars("short", EXTRACT_LIMIT);
        assert!(!truncated);
        assert_eq!(excerpt, "short");
    }

    #[test]
    fn summary_is_deterministic_and_bounded() {
        let first = summarize(SAMPLE, 3);
        let second = summarize(SAMPLE, 3);
        assert_eq!(first, second);
        assert!(split_sentences(&first).len() <= 3);
        assert!(!first.is_empty());
    }

    #[test]
    fn summary_preserves_original_order() {
        let summary = summarize(SAMPLE, 2);
        let sentences = split_sentences(&summary);
        let positions: Vec<usize> = sentences
            .iter()
            .map(|s| SAMPLE.find(s.as_str()).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn qa_finds_the_overlapping_sentence() {
        let answer = answer_question(SAMPLE, "How is decay heat removed?");
        assert!(answer.to_lowercase().contains("decay heat"));

        let miss = answer_question(SAMPLE, "What color is the turbine hall?");
        assert_eq!(miss, "No relevant passage found.");
    }

    #[test]
    fn plain_text_formats_pass_through() {
        let text = extract_text("txt", b"hello world", |_, _| {}).unwrap();
        assert_eq!(text, "hello world");
    }

    #[test]
    fn malformed_pdf_is_an_argument_error() {
        let err = extract_text("pdf", b"not a pdf", |_, _| {}).unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgument { .. }));
    }

    fn ctx() -> InvokeContext {
        let sessions = Arc::new(crate::session::SessionManager::new());
        let session = sessions.open();
        InvokeContext {
            session_id: session.id,
            call_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            sessions,
        }
    }

    #[tokio::test]
    async fn upload_needs_file_data_or_document_id_but_not_both() {
        let plugin = DocumentAnalysisPlugin;
        let ctx = ctx();

        let mut args = Map::new();
        args.insert("filename".into(), json!("a.txt"));
        let err = plugin
            .invoke(&ctx, "analyze_document", args.clone())
            .await
            .unwrap_err();
        match err {
            ToolError::InvalidArgument { name, .. } => assert_eq!(name, "file_data"),
            other => panic!("unexpected error: {other}"),
        }

        args.insert("file_data".into(), json!(BASE64.encode("hello")));
        args.insert("document_id".into(), json!("deadbeef"));
        let err = plugin
            .invoke(&ctx, "analyze_document", args)
            .await
            .unwrap_err();
        match err {
            ToolError::InvalidArgument { name, .. } => assert_eq!(name, "document_id"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn reanalyzing_an_unknown_document_is_not_found() {
        let plugin = DocumentAnalysisPlugin;
        let mut args = Map::new();
        args.insert("document_id".into(), json!("deadbeef"));
        args.insert("analysis_type".into(), json!("summarize"));
        let err = plugin
            .invoke(&ctx(), "analyze_document", args)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }
}
