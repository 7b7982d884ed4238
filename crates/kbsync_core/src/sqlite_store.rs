use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::settings::{Settings, SyncMode};
use crate::store::{
    AliasStore, Document, DocumentId, DocumentStore, NewDocument, SettingsStore, TermId, TermStore,
};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS document_types (
    name TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    document_type TEXT NOT NULL,
    external_id TEXT NOT NULL,
    title TEXT NOT NULL,
    body_html TEXT NOT NULL,
    content_type_term INTEGER,
    brand_division_term INTEGER,
    server_type_term INTEGER,
    product_type_term INTEGER,
    source_created_date TEXT NOT NULL,
    source_modified_date TEXT NOT NULL,
    published INTEGER NOT NULL,
    owner_uid INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_documents_external_id
    ON documents(document_type, external_id);

CREATE TABLE IF NOT EXISTS document_product_terms (
    document_id INTEGER NOT NULL,
    position INTEGER NOT NULL,
    term_id INTEGER NOT NULL,
    PRIMARY KEY (document_id, position)
);

CREATE TABLE IF NOT EXISTS taxonomy_terms (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    vocabulary TEXT NOT NULL,
    name TEXT NOT NULL,
    UNIQUE (vocabulary, name)
);

CREATE TABLE IF NOT EXISTS path_aliases (
    alias TEXT PRIMARY KEY,
    path TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_settings (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    password_encoded TEXT NOT NULL,
    mode TEXT NOT NULL
);
"#;

/// Open the shared database, creating parent directories and the schema
/// when missing. Every store opens its own connection against this path.
pub fn open_connection(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    initialize_schema(&connection)?;
    Ok(connection)
}

pub fn initialize_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(SCHEMA_SQL)
        .context("failed to initialize kbsync schema")
}

/// Register a document type so ingest requests for it are accepted.
pub fn provision_document_type(connection: &Connection, name: &str) -> Result<()> {
    connection
        .execute(
            "INSERT OR IGNORE INTO document_types (name) VALUES (?1)",
            [name],
        )
        .with_context(|| format!("failed to provision document type {name}"))?;
    Ok(())
}

pub struct SqliteDocumentStore {
    connection: Connection,
}

impl SqliteDocumentStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        Ok(Self {
            connection: open_connection(db_path)?,
        })
    }

    pub fn from_connection(connection: Connection) -> Result<Self> {
        initialize_schema(&connection)?;
        Ok(Self { connection })
    }

    fn load_product_terms(&self, document_id: DocumentId) -> Result<Vec<TermId>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT term_id FROM document_product_terms
                 WHERE document_id = ?1 ORDER BY position",
            )
            .context("failed to prepare product term query")?;
        let rows = statement
            .query_map([document_id], |row| row.get(0))
            .context("failed to run product term query")?;
        let mut terms = Vec::new();
        for row in rows {
            terms.push(row.context("failed to decode product term row")?);
        }
        Ok(terms)
    }

    fn save_product_terms(&self, document_id: DocumentId, terms: &[TermId]) -> Result<()> {
        self.connection
            .execute(
                "DELETE FROM document_product_terms WHERE document_id = ?1",
                [document_id],
            )
            .context("failed to clear product terms")?;
        for (position, term_id) in terms.iter().enumerate() {
            self.connection
                .execute(
                    "INSERT INTO document_product_terms (document_id, position, term_id)
                     VALUES (?1, ?2, ?3)",
                    params![document_id, position as i64, term_id],
                )
                .context("failed to insert product term")?;
        }
        Ok(())
    }
}

impl DocumentStore for SqliteDocumentStore {
    fn document_type_exists(&mut self, document_type: &str) -> Result<bool> {
        let exists: i64 = self
            .connection
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM document_types WHERE name = ?1)",
                [document_type],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to check document type {document_type}"))?;
        Ok(exists == 1)
    }

    fn find_by_external_id(
        &mut self,
        document_type: &str,
        external_id: &str,
    ) -> Result<Vec<DocumentId>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT id FROM documents
                 WHERE document_type = ?1 AND external_id = ?2 ORDER BY id",
            )
            .context("failed to prepare external id query")?;
        let rows = statement
            .query_map(params![document_type, external_id], |row| row.get(0))
            .context("failed to run external id query")?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("failed to decode document id row")?);
        }
        Ok(ids)
    }

    fn load(&mut self, id: DocumentId) -> Result<Option<Document>> {
        let document = self
            .connection
            .query_row(
                "SELECT id, document_type, external_id, title, body_html,
                        content_type_term, brand_division_term, server_type_term,
                        product_type_term, source_created_date, source_modified_date,
                        published, owner_uid
                 FROM documents WHERE id = ?1",
                [id],
                |row| {
                    Ok(Document {
                        id: row.get(0)?,
                        document_type: row.get(1)?,
                        external_id: row.get(2)?,
                        title: row.get(3)?,
                        body_html: row.get(4)?,
                        content_type_term: row.get(5)?,
                        brand_division_term: row.get(6)?,
                        product_terms: Vec::new(),
                        server_type_term: row.get(7)?,
                        product_type_term: row.get(8)?,
                        source_created_date: row.get(9)?,
                        source_modified_date: row.get(10)?,
                        published: row.get(11)?,
                        owner_uid: row.get(12)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to load document {id}"))?;

        match document {
            Some(mut document) => {
                document.product_terms = self.load_product_terms(document.id)?;
                Ok(Some(document))
            }
            None => Ok(None),
        }
    }

    fn create(&mut self, document: NewDocument) -> Result<Document> {
        self.connection
            .execute(
                "INSERT INTO documents (
                    document_type, external_id, title, body_html, content_type_term,
                    brand_division_term, server_type_term, product_type_term,
                    source_created_date, source_modified_date, published, owner_uid
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    document.document_type,
                    document.external_id,
                    document.title,
                    document.body_html,
                    document.content_type_term,
                    document.brand_division_term,
                    document.server_type_term,
                    document.product_type_term,
                    document.source_created_date,
                    document.source_modified_date,
                    document.published,
                    document.owner_uid,
                ],
            )
            .with_context(|| {
                format!("failed to create document for {}", document.external_id)
            })?;
        let id = self.connection.last_insert_rowid();
        self.save_product_terms(id, &document.product_terms)?;

        Ok(Document {
            id,
            document_type: document.document_type,
            external_id: document.external_id,
            title: document.title,
            body_html: document.body_html,
            content_type_term: document.content_type_term,
            brand_division_term: document.brand_division_term,
            product_terms: document.product_terms,
            server_type_term: document.server_type_term,
            product_type_term: document.product_type_term,
            source_created_date: document.source_created_date,
            source_modified_date: document.source_modified_date,
            published: document.published,
            owner_uid: document.owner_uid,
        })
    }

    fn save(&mut self, document: &Document) -> Result<()> {
        self.connection
            .execute(
                "UPDATE documents SET
                    document_type = ?2, external_id = ?3, title = ?4, body_html = ?5,
                    content_type_term = ?6, brand_division_term = ?7,
                    server_type_term = ?8, product_type_term = ?9,
                    source_created_date = ?10, source_modified_date = ?11,
                    published = ?12, owner_uid = ?13
                 WHERE id = ?1",
                params![
                    document.id,
                    document.document_type,
                    document.external_id,
                    document.title,
                    document.body_html,
                    document.content_type_term,
                    document.brand_division_term,
                    document.server_type_term,
                    document.product_type_term,
                    document.source_created_date,
                    document.source_modified_date,
                    document.published,
                    document.owner_uid,
                ],
            )
            .with_context(|| format!("failed to save document {}", document.id))?;
        self.save_product_terms(document.id, &document.product_terms)
    }
}

pub struct SqliteTermStore {
    connection: Connection,
}

impl SqliteTermStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        Ok(Self {
            connection: open_connection(db_path)?,
        })
    }

    pub fn from_connection(connection: Connection) -> Result<Self> {
        initialize_schema(&connection)?;
        Ok(Self { connection })
    }
}

impl TermStore for SqliteTermStore {
    fn find_term(&mut self, vocabulary: &str, name: &str) -> Result<Option<TermId>> {
        self.connection
            .query_row(
                "SELECT id FROM taxonomy_terms WHERE vocabulary = ?1 AND name = ?2",
                params![vocabulary, name],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to look up term {name} in {vocabulary}"))
    }

    fn create_term(&mut self, vocabulary: &str, name: &str) -> Result<TermId> {
        self.connection
            .execute(
                "INSERT INTO taxonomy_terms (vocabulary, name) VALUES (?1, ?2)",
                params![vocabulary, name],
            )
            .with_context(|| format!("failed to create term {name} in {vocabulary}"))?;
        Ok(self.connection.last_insert_rowid())
    }
}

pub struct SqliteAliasStore {
    connection: Connection,
}

impl SqliteAliasStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        Ok(Self {
            connection: open_connection(db_path)?,
        })
    }

    pub fn from_connection(connection: Connection) -> Result<Self> {
        initialize_schema(&connection)?;
        Ok(Self { connection })
    }

    pub fn lookup_path(&self, alias: &str) -> Result<Option<String>> {
        self.connection
            .query_row(
                "SELECT path FROM path_aliases WHERE alias = ?1",
                [alias],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to look up alias {alias}"))
    }
}

impl AliasStore for SqliteAliasStore {
    fn create_alias(&mut self, path: &str, alias: &str) -> Result<()> {
        self.connection
            .execute(
                "INSERT INTO path_aliases (alias, path) VALUES (?1, ?2)
                 ON CONFLICT(alias) DO UPDATE SET path = excluded.path",
                params![alias, path],
            )
            .with_context(|| format!("failed to save alias {alias}"))?;
        Ok(())
    }
}

pub struct SqliteSettingsStore {
    connection: Connection,
}

impl SqliteSettingsStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        Ok(Self {
            connection: open_connection(db_path)?,
        })
    }

    pub fn from_connection(connection: Connection) -> Result<Self> {
        initialize_schema(&connection)?;
        Ok(Self { connection })
    }

    /// Write the seeded defaults unless a settings row already exists.
    pub fn seed_defaults(&mut self) -> Result<bool> {
        if self.load()?.is_some() {
            return Ok(false);
        }
        self.save(&Settings::seeded())?;
        Ok(true)
    }
}

impl SettingsStore for SqliteSettingsStore {
    fn load(&mut self) -> Result<Option<Settings>> {
        let row: Option<(String, String)> = self
            .connection
            .query_row(
                "SELECT password_encoded, mode FROM sync_settings WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("failed to load settings")?;

        match row {
            Some((password_encoded, mode)) => Ok(Some(Settings {
                password_encoded,
                mode: SyncMode::parse(&mode).context("stored settings are invalid")?,
            })),
            None => Ok(None),
        }
    }

    fn save(&mut self, settings: &Settings) -> Result<()> {
        self.connection
            .execute(
                "INSERT INTO sync_settings (id, password_encoded, mode) VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET
                    password_encoded = excluded.password_encoded,
                    mode = excluded.mode",
                params![settings.password_encoded, settings.mode.as_str()],
            )
            .context("failed to save settings")?;
        Ok(())
    }
}
