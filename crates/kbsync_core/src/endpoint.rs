use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::diagnostics::DiagnosticsLog;
use crate::mirror::ImageMirror;
use crate::records::{ParsedPayload, parse_payload};
use crate::settings::SyncMode;
use crate::store::{
    AliasStore, BlobStore, DocumentStore, KNOWLEDGE_BASE_TYPE, SettingsStore, TermStore,
};
use crate::sync::sync_records;

/// Status and JSON body for the ingest endpoint, independent of the web
/// framework carrying it.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

/// Everything one ingest request needs. The mirror is optional equipment;
/// it only takes effect when the stored mode asks for image mirroring.
pub struct Collaborators<'a> {
    pub documents: &'a mut dyn DocumentStore,
    pub terms: &'a mut dyn TermStore,
    pub blobs: &'a mut dyn BlobStore,
    pub aliases: &'a mut dyn AliasStore,
    pub settings: &'a mut dyn SettingsStore,
    pub mirror: Option<&'a mut ImageMirror>,
}

/// Full request orchestration: credential check, provisioning check, parse,
/// sync, response. Per-record problems never surface as errors here; they
/// come back inside the diagnostics payload of a 200.
pub fn handle_request(
    auth_header: Option<&str>,
    body: &[u8],
    collaborators: Collaborators<'_>,
) -> ApiResponse {
    let Collaborators {
        documents,
        terms,
        blobs,
        aliases,
        settings,
        mut mirror,
    } = collaborators;

    let stored = match settings.load() {
        Ok(Some(stored)) => stored,
        Ok(None) => {
            warn!("no stored settings; rejecting ingest request");
            return unauthorized();
        }
        Err(err) => return internal_error(&err),
    };

    if !auth_header.is_some_and(|header| stored.accepts(header)) {
        return unauthorized();
    }

    match documents.document_type_exists(KNOWLEDGE_BASE_TYPE) {
        Ok(true) => {}
        Ok(false) => {
            return ApiResponse {
                status: 404,
                body: json!({ "message": "Content type does not exist" }),
            };
        }
        Err(err) => return internal_error(&err),
    }

    let mirror = if stored.mode.mirrors_images() {
        mirror.as_deref_mut()
    } else {
        None
    };
    ingest_payload(body, stored.mode, documents, terms, blobs, aliases, mirror)
}

/// Parse and synchronize one payload. Shared by the HTTP endpoint and the
/// operator `import` command, which has already settled authentication.
pub fn ingest_payload(
    body: &[u8],
    mode: SyncMode,
    documents: &mut dyn DocumentStore,
    terms: &mut dyn TermStore,
    blobs: &mut dyn BlobStore,
    aliases: &mut dyn AliasStore,
    mirror: Option<&mut ImageMirror>,
) -> ApiResponse {
    let mut diagnostics = DiagnosticsLog::new();
    let parsed = match parse_payload(body, mirror, &mut diagnostics) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!("rejected payload: {err}");
            return ApiResponse {
                status: 400,
                body: json!({
                    "message": "XML parsing error",
                    "data": err.diagnostics,
                }),
            };
        }
    };

    match parsed {
        ParsedPayload::UnknownRoot { root } => {
            info!(root, "ignoring payload with unrecognized root");
            ApiResponse {
                status: 200,
                body: json!({
                    "Message":
                        format!("Only Error Code and Technote payloads are accepted (got <{root}>)"),
                    "Data Response": diagnostics.to_json(),
                }),
            }
        }
        ParsedPayload::Records { records, .. } => {
            let report = sync_records(
                documents,
                terms,
                blobs,
                aliases,
                mode,
                &records,
                &mut diagnostics,
            );
            info!(
                records = records.len(),
                created = report.created,
                updated = report.updated,
                mode = mode.as_str(),
                "knowledge-base sync completed"
            );
            let message = if records.is_empty() { "Failed" } else { "Success" };
            ApiResponse {
                status: 200,
                body: json!({
                    "Message": message,
                    "Data Response": diagnostics.to_json(),
                }),
            }
        }
    }
}

fn unauthorized() -> ApiResponse {
    ApiResponse {
        status: 401,
        body: json!({ "error": "Authorization failed" }),
    }
}

fn internal_error(err: &anyhow::Error) -> ApiResponse {
    error!("ingest request failed: {err:#}");
    ApiResponse {
        status: 500,
        body: json!({ "error": "internal error" }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::FileBlobStore;
    use crate::sqlite_store::{
        SqliteAliasStore, SqliteDocumentStore, SqliteSettingsStore, SqliteTermStore,
        open_connection, provision_document_type,
    };
    use crate::store::KNOWLEDGE_BASE_TYPE;
    use crate::taxonomy::{BRAND_DIVISION_VOCABULARY, CONTENT_TYPE_VOCABULARY};
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _temp: TempDir,
        documents: SqliteDocumentStore,
        terms: SqliteTermStore,
        blobs: FileBlobStore,
        aliases: SqliteAliasStore,
        settings: SqliteSettingsStore,
    }

    impl Fixture {
        fn new(provision: bool) -> Self {
            let temp = tempdir().expect("tempdir");
            let db_path = temp.path().join("kbsync.db");
            let connection = open_connection(&db_path).expect("open db");
            if provision {
                provision_document_type(&connection, KNOWLEDGE_BASE_TYPE).expect("provision");
            }
            drop(connection);

            let mut settings = SqliteSettingsStore::open(&db_path).expect("settings store");
            settings.seed_defaults().expect("seed settings");
            let mut terms = SqliteTermStore::open(&db_path).expect("term store");
            seed_terms(&mut terms);

            Self {
                blobs: FileBlobStore::new(temp.path().join("files"), "/files"),
                documents: SqliteDocumentStore::open(&db_path).expect("document store"),
                aliases: SqliteAliasStore::open(&db_path).expect("alias store"),
                terms,
                settings,
                _temp: temp,
            }
        }

        fn request(&mut self, auth_header: Option<&str>, body: &str) -> ApiResponse {
            handle_request(
                auth_header,
                body.as_bytes(),
                Collaborators {
                    documents: &mut self.documents,
                    terms: &mut self.terms,
                    blobs: &mut self.blobs,
                    aliases: &mut self.aliases,
                    settings: &mut self.settings,
                    mirror: None,
                },
            )
        }
    }

    fn seed_terms(terms: &mut SqliteTermStore) {
        use crate::store::TermStore;
        for (vocabulary, name) in [
            (BRAND_DIVISION_VOCABULARY, "Datacard"),
            (BRAND_DIVISION_VOCABULARY, "ECS"),
            (CONTENT_TYPE_VOCABULARY, "Tech Note"),
            (CONTENT_TYPE_VOCABULARY, "Error Code"),
        ] {
            terms.create_term(vocabulary, name).expect("seed term");
        }
    }

    fn technote_payload(external_id: &str) -> String {
        format!(
            r#"<Technote__kavList>
  <Technote__kav>
    <Id>{external_id}</Id>
    <Title>Reset the reader</Title>
    <UrlName>Reset-The-Reader</UrlName>
    <Brand_Division__c>ECS</Brand_Division__c>
    <CreatedDate>2024-01-02T03:04:05.000Z</CreatedDate>
    <LastModifiedDate>2024-02-03T04:05:06.000Z</LastModifiedDate>
    <PublishStatus>Online</PublishStatus>
    <Detail_For_External_KB__c>&lt;p&gt;body&lt;/p&gt;</Detail_For_External_KB__c>
  </Technote__kav>
</Technote__kavList>"#
        )
    }

    #[test]
    fn wrong_credential_is_rejected() {
        let mut fixture = Fixture::new(true);
        assert_eq!(fixture.request(Some("wrong"), "<Foo/>").status, 401);
        assert_eq!(fixture.request(None, "<Foo/>").status, 401);
    }

    #[test]
    fn unprovisioned_document_type_is_a_404() {
        let mut fixture = Fixture::new(false);
        let response = fixture.request(Some("firmware"), &technote_payload("ka0"));
        assert_eq!(response.status, 404);
    }

    #[test]
    fn malformed_xml_is_a_400_with_diagnostics() {
        let mut fixture = Fixture::new(true);
        let response = fixture.request(Some("firmware"), "<Technote__kavList><oops>");
        assert_eq!(response.status, 400);
        assert_eq!(response.body["message"], "XML parsing error");
        assert!(!response.body["data"].as_array().expect("data list").is_empty());
    }

    #[test]
    fn unknown_root_is_an_informational_200() {
        let mut fixture = Fixture::new(true);
        let response = fixture.request(Some("firmware"), "<Foo><Bar>x</Bar></Foo>");
        assert_eq!(response.status, 200);
        let message = response.body["Message"].as_str().expect("message");
        assert!(message.contains("accepted"));
    }

    #[test]
    fn technote_payload_syncs_idempotently() {
        let mut fixture = Fixture::new(true);

        let first = fixture.request(Some("firmware"), &technote_payload("ka0TN1"));
        assert_eq!(first.status, 200);
        assert_eq!(first.body["Message"], "Success");

        let second = fixture.request(Some("firmware"), &technote_payload("ka0TN1"));
        assert_eq!(second.status, 200);
        assert_eq!(second.body["Message"], "Success");

        use crate::store::DocumentStore;
        let ids = fixture
            .documents
            .find_by_external_id(KNOWLEDGE_BASE_TYPE, "ka0TN1")
            .expect("find");
        assert_eq!(ids.len(), 1);
        let document = fixture
            .documents
            .load(ids[0])
            .expect("load")
            .expect("document exists");
        assert!(document.published);
        assert_eq!(document.body_html, "<p>body</p><ul></ul>");
        assert_eq!(
            fixture
                .aliases
                .lookup_path("/knowledgebase/ssl/reset-the-reader")
                .expect("lookup"),
            Some(format!("/document/{}", ids[0]))
        );
    }

    #[test]
    fn recognized_root_with_no_entries_reports_failed() {
        let mut fixture = Fixture::new(true);
        let response = fixture.request(
            Some("firmware"),
            "<Error_Code__kavList></Error_Code__kavList>",
        );
        assert_eq!(response.status, 200);
        assert_eq!(response.body["Message"], "Failed");
    }
}
