use anyhow::Result;
use serde::Serialize;

use crate::settings::Settings;

/// Document type every knowledge-base article is stored under.
pub const KNOWLEDGE_BASE_TYPE: &str = "knowledge_base";

/// Fixed owner account for documents created by the feed.
pub const SYSTEM_OWNER_UID: i64 = 1;

pub type DocumentId = i64;
pub type TermId = i64;

/// A persisted content record. Outlives the request; article records are
/// mapped onto it by the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Document {
    pub id: DocumentId,
    pub document_type: String,
    pub external_id: String,
    pub title: String,
    pub body_html: String,
    pub content_type_term: Option<TermId>,
    pub brand_division_term: Option<TermId>,
    pub product_terms: Vec<TermId>,
    pub server_type_term: Option<TermId>,
    pub product_type_term: Option<TermId>,
    pub source_created_date: String,
    pub source_modified_date: String,
    pub published: bool,
    pub owner_uid: i64,
}

/// Field set for creating a document; the store assigns the id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewDocument {
    pub document_type: String,
    pub external_id: String,
    pub title: String,
    pub body_html: String,
    pub content_type_term: Option<TermId>,
    pub brand_division_term: Option<TermId>,
    pub product_terms: Vec<TermId>,
    pub server_type_term: Option<TermId>,
    pub product_type_term: Option<TermId>,
    pub source_created_date: String,
    pub source_modified_date: String,
    pub published: bool,
    pub owner_uid: i64,
}

pub trait DocumentStore {
    fn document_type_exists(&mut self, document_type: &str) -> Result<bool>;
    fn find_by_external_id(
        &mut self,
        document_type: &str,
        external_id: &str,
    ) -> Result<Vec<DocumentId>>;
    fn load(&mut self, id: DocumentId) -> Result<Option<Document>>;
    fn create(&mut self, document: NewDocument) -> Result<Document>;
    fn save(&mut self, document: &Document) -> Result<()>;
}

pub trait TermStore {
    fn find_term(&mut self, vocabulary: &str, name: &str) -> Result<Option<TermId>>;
    fn create_term(&mut self, vocabulary: &str, name: &str) -> Result<TermId>;
}

pub trait BlobStore {
    fn exists(&mut self, relative_path: &str) -> bool;
    /// Write `bytes` under `directory/filename` and return the public URL
    /// of the stored blob.
    fn write_file(&mut self, directory: &str, filename: &str, bytes: &[u8]) -> Result<String>;
    fn public_url(&self, relative_path: &str) -> String;
}

pub trait AliasStore {
    fn create_alias(&mut self, path: &str, alias: &str) -> Result<()>;
}

pub trait SettingsStore {
    fn load(&mut self) -> Result<Option<Settings>>;
    fn save(&mut self, settings: &Settings) -> Result<()>;
}
