//! Per-connection session state.
//!
//! A session owns the documents uploaded over its connection, the jobs it has
//! started and the artifacts it has generated. All mutation goes through
//! a per-session async mutex, so writers are serialized without any global
//! lock. The manager itself holds no references to the executor or gateway;
//! closing a session returns the owned job ids and the caller cancels them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ToolError;

/// What the most recent analysis request asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    Extract,
    Summarize,
    Qa,
}

impl AnalysisType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Summarize => "summarize",
            Self::Qa => "qa",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QaPair {
    pub question: String,
    pub answer: String,
}

/// An uploaded document and everything derived from it so far. The raw
/// content is retained so later requests can re-analyze by document id
/// without re-uploading.
#[derive(Debug, Clone)]
pub struct Document {
    pub document_id: String,
    pub filename: String,
    pub content: Vec<u8>,
    pub analysis_type: AnalysisType,
    pub extracted_content: Option<String>,
    pub summary: Option<String>,
    pub qa_pairs: Vec<QaPair>,
    /// Analysis job currently working on this document, if any. At most one.
    pub active_job: Option<Uuid>,
}

#[derive(Default)]
struct SessionState {
    documents: HashMap<String, Document>,
    jobs: HashSet<Uuid>,
    /// Metadata of every image generated this session, upload order.
    images: Vec<Value>,
    last_artifact: Option<Value>,
}

pub struct Session {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
}

impl Session {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Record an analysis request against an uploaded document, creating the
    /// record if this is the first time the content is seen. Fails with
    /// `Conflict` while a previous analysis job on the same document is
    /// still in flight.
    pub async fn begin_analysis(
        &self,
        document_id: &str,
        filename: &str,
        content: &[u8],
        analysis_type: AnalysisType,
        job_id: Uuid,
    ) -> Result<(), ToolError> {
        let mut state = self.state.lock().await;
        if let Some(doc) = state.documents.get(document_id) {
            if doc.active_job.is_some() {
                return Err(ToolError::Conflict(format!(
                    "analysis already running for document '{}'",
                    doc.filename
                )));
            }
        }
        let doc = state
            .documents
            .entry(document_id.to_string())
            .or_insert_with(|| Document {
                document_id: document_id.to_string(),
                filename: filename.to_string(),
                content: content.to_vec(),
                analysis_type,
                extracted_content: None,
                summary: None,
                qa_pairs: Vec::new(),
                active_job: None,
            });
        doc.analysis_type = analysis_type;
        doc.active_job = Some(job_id);
        state.jobs.insert(job_id);
        Ok(())
    }

    /// Record an analysis request against an already-stored document and
    /// hand back its record (including the retained content) so the job can
    /// run without the client re-sending the bytes.
    pub async fn begin_reanalysis(
        &self,
        document_id: &str,
        analysis_type: AnalysisType,
        job_id: Uuid,
    ) -> Result<Document, ToolError> {
        let mut state = self.state.lock().await;
        let doc = state.documents.get_mut(document_id).ok_or_else(|| {
            ToolError::NotFound(format!("document '{document_id}' not found"))
        })?;
        if doc.active_job.is_some() {
            return Err(ToolError::Conflict(format!(
                "analysis already running for document '{}'",
                doc.filename
            )));
        }
        doc.analysis_type = analysis_type;
        doc.active_job = Some(job_id);
        let snapshot = doc.clone();
        state.jobs.insert(job_id);
        Ok(snapshot)
    }

    /// Store the output of a finished analysis pass.
    pub async fn store_analysis(
        &self,
        document_id: &str,
        extracted: Option<String>,
        summary: Option<String>,
        qa: Option<QaPair>,
    ) {
        let mut state = self.state.lock().await;
        if let Some(doc) = state.documents.get_mut(document_id) {
            if extracted.is_some() {
                doc.extracted_content = extracted;
            }
            if summary.is_some() {
                doc.summary = summary;
            }
            if let Some(pair) = qa {
                doc.qa_pairs.push(pair);
            }
        }
    }

    pub async fn document(&self, document_id: &str) -> Option<Document> {
        self.state.lock().await.documents.get(document_id).cloned()
    }

    pub async fn find_document_by_name(&self, filename: &str) -> Option<Document> {
        let state = self.state.lock().await;
        state
            .documents
            .values()
            .find(|d| d.filename == filename)
            .cloned()
    }

    /// Snapshot of every stored document, ordered by filename.
    pub async fn list_documents(&self) -> Vec<Document> {
        let state = self.state.lock().await;
        let mut docs: Vec<Document> = state.documents.values().cloned().collect();
        docs.sort_by(|a, b| a.filename.cmp(&b.filename).then(a.document_id.cmp(&b.document_id)));
        docs
    }

    /// Remove a document. Returns the in-flight job that was referencing it,
    /// if any, so the caller can cancel it.
    pub async fn delete_document(&self, document_id: &str) -> Result<Option<Uuid>, ToolError> {
        let mut state = self.state.lock().await;
        match state.documents.remove(document_id) {
            Some(doc) => {
                debug!(document_id, filename = %doc.filename, "document deleted");
                Ok(doc.active_job)
            }
            None => Err(ToolError::NotFound(format!(
                "document '{document_id}' not found"
            ))),
        }
    }

    pub async fn track_job(&self, job_id: Uuid) {
        self.state.lock().await.jobs.insert(job_id);
    }

    /// Called by the executor when a job reaches a terminal state: drops the
    /// job from the owned set, releases the document it was holding and
    /// records the produced artifact.
    pub async fn finish_job(
        &self,
        job_id: Uuid,
        document_id: Option<&str>,
        artifact: Option<Value>,
    ) {
        let mut state = self.state.lock().await;
        state.jobs.remove(&job_id);
        if let Some(doc_id) = document_id {
            if let Some(doc) = state.documents.get_mut(doc_id) {
                if doc.active_job == Some(job_id) {
                    doc.active_job = None;
                }
            }
        }
        if let Some(artifact) = artifact {
            // The listing keeps metadata only; the encoded image stays in
            // the full artifact.
            let mut metadata = artifact.clone();
            if let Some(map) = metadata.as_object_mut() {
                map.remove("image_base64");
            }
            state.images.push(metadata);
            state.last_artifact = Some(artifact);
        }
    }

    /// Metadata of images generated this session, oldest first.
    pub async fn generated_images(&self) -> Vec<Value> {
        self.state.lock().await.images.clone()
    }

    /// Drop all stored image data. Returns whether anything was cleared.
    pub async fn clear_last_artifact(&self) -> bool {
        let mut state = self.state.lock().await;
        let had_data = state.last_artifact.is_some() || !state.images.is_empty();
        state.last_artifact = None;
        state.images.clear();
        had_data
    }

    pub async fn document_count(&self) -> usize {
        self.state.lock().await.documents.len()
    }
}

/// Registry of live sessions, one per connected client.
#[derive(Default)]
pub struct SessionManager {
    sessions: DashMap<Uuid, Arc<Session>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) -> Arc<Session> {
        let id = Uuid::new_v4();
        let session = Arc::new(Session::new(id));
        self.sessions.insert(id, session.clone());
        info!(session_id = %id, "session opened");
        session
    }

    pub fn get(&self, id: Uuid) -> Result<Arc<Session>, ToolError> {
        self.sessions
            .get(&id)
            .map(|s| s.clone())
            .ok_or_else(|| ToolError::NotFound(format!("session '{id}' not found")))
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Tear down a session and return the job ids it still owned. The caller
    /// cancels them through the executor; cancellation is best-effort and
    /// must not block the close.
    pub async fn close(&self, id: Uuid) -> Vec<Uuid> {
        match self.sessions.remove(&id) {
            Some((_, session)) => {
                let state = session.state.lock().await;
                let owned: Vec<Uuid> = state.jobs.iter().copied().collect();
                info!(session_id = %id, inflight_jobs = owned.len(), "session closed");
                owned
            }
            None => Vec::new(),
        }
    }

    /// Convenience used by the executor's terminal handling.
    pub async fn finish_job(
        &self,
        session_id: Uuid,
        job_id: Uuid,
        document_id: Option<&str>,
        artifact: Option<Value>,
    ) {
        if let Some(session) = self.sessions.get(&session_id).map(|s| s.clone()) {
            session.finish_job(job_id, document_id, artifact).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn second_analysis_on_busy_document_conflicts() {
        let manager = SessionManager::new();
        let session = manager.open();
        let job_a = Uuid::new_v4();
        session
            .begin_analysis("doc1", "report.pdf", b"content", AnalysisType::Summarize, job_a)
            .await
            .unwrap();

        let job_b = Uuid::new_v4();
        let err = session
            .begin_analysis("doc1", "report.pdf", b"content", AnalysisType::Qa, job_b)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Conflict(_)));

        // After the first job releases the document the second attempt works
        // and the analysis type reflects the newest request.
        session.finish_job(job_a, Some("doc1"), None).await;
        session
            .begin_analysis("doc1", "report.pdf", b"content", AnalysisType::Qa, job_b)
            .await
            .unwrap();
        let doc = session.document("doc1").await.unwrap();
        assert_eq!(doc.analysis_type, AnalysisType::Qa);
    }

    #[tokio::test]
    async fn reanalysis_returns_retained_content() {
        let manager = SessionManager::new();
        let session = manager.open();
        let job_a = Uuid::new_v4();
        session
            .begin_analysis("doc1", "notes.txt", b"retained bytes", AnalysisType::Extract, job_a)
            .await
            .unwrap();
        session.finish_job(job_a, Some("doc1"), None).await;

        let job_b = Uuid::new_v4();
        let doc = session
            .begin_reanalysis("doc1", AnalysisType::Summarize, job_b)
            .await
            .unwrap();
        assert_eq!(doc.content, b"retained bytes");
        assert_eq!(doc.filename, "notes.txt");
        assert_eq!(doc.analysis_type, AnalysisType::Summarize);

        // Busy document conflicts; unknown document is not found.
        let err = session
            .begin_reanalysis("doc1", AnalysisType::Qa, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Conflict(_)));
        let err = session
            .begin_reanalysis("missing", AnalysisType::Qa, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_returns_inflight_job_for_cancellation() {
        let manager = SessionManager::new();
        let session = manager.open();
        let job = Uuid::new_v4();
        session
            .begin_analysis("doc1", "notes.txt", b"hello", AnalysisType::Extract, job)
            .await
            .unwrap();

        let inflight = session.delete_document("doc1").await.unwrap();
        assert_eq!(inflight, Some(job));
        assert!(session.delete_document("doc1").await.is_err());
    }

    #[tokio::test]
    async fn close_returns_owned_jobs() {
        let manager = SessionManager::new();
        let session = manager.open();
        let id = session.id;
        let job = Uuid::new_v4();
        session.track_job(job).await;

        let owned = manager.close(id).await;
        assert_eq!(owned, vec![job]);
        assert!(manager.get(id).is_err());
    }

    #[tokio::test]
    async fn list_documents_is_ordered_by_filename() {
        let manager = SessionManager::new();
        let session = manager.open();
        for (id, name) in [("d2", "beta.txt"), ("d1", "alpha.txt")] {
            let job = Uuid::new_v4();
            session
                .begin_analysis(id, name, b"x", AnalysisType::Extract, job)
                .await
                .unwrap();
            session.finish_job(job, Some(id), None).await;
        }
        let docs = session.list_documents().await;
        let names: Vec<&str> = docs.iter().map(|d| d.filename.as_str()).collect();
        assert_eq!(names, vec!["alpha.txt", "beta.txt"]);
    }

    #[tokio::test]
    async fn finish_job_stores_artifact_and_image_listing() {
        let manager = SessionManager::new();
        let session = manager.open();
        let job = Uuid::new_v4();
        session.track_job(job).await;
        session
            .finish_job(
                job,
                None,
                Some(json!({"image_id": "abc", "image_base64": "AAAA"})),
            )
            .await;

        // The listing carries metadata only.
        let images = session.generated_images().await;
        assert_eq!(images.len(), 1);
        assert_eq!(images[0]["image_id"], "abc");
        assert!(images[0].get("image_base64").is_none());

        assert!(session.clear_last_artifact().await);
        assert!(session.generated_images().await.is_empty());
        assert!(!session.clear_last_artifact().await);
    }
}
