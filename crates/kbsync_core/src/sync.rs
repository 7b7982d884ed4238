use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, NaiveDateTime};
use serde::Serialize;
use tracing::{error, info};

use crate::diagnostics::{DiagnosticsLog, steps};
use crate::publish::{TechnotePublishInputs, derive_error_code_state, derive_technote_state};
use crate::records::{ArticleRecord, AttachmentData, ErrorCodeFields, RecordPayload, TechnoteFields};
use crate::settings::SyncMode;
use crate::store::{
    AliasStore, BlobStore, DocumentId, DocumentStore, KNOWLEDGE_BASE_TYPE, NewDocument,
    SYSTEM_OWNER_UID, TermId, TermStore,
};
use crate::taxonomy::{
    CONTENT_TYPE_VOCABULARY, PRODUCT_TYPES_VOCABULARY, PRODUCTS_VOCABULARY,
    SERVER_TYPES_VOCABULARY, TaxonomyResolver,
};

const OUTPUT_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
}

enum RecordAction {
    Created,
    Updated,
}

/// Reconcile every parsed record against the document store, strictly in
/// document order. A record that fails outright is recorded in the ledger
/// and never blocks the records after it.
pub fn sync_records(
    documents: &mut dyn DocumentStore,
    terms: &mut dyn TermStore,
    blobs: &mut dyn BlobStore,
    aliases: &mut dyn AliasStore,
    mode: SyncMode,
    records: &[ArticleRecord],
    diagnostics: &mut DiagnosticsLog,
) -> SyncReport {
    let resolver = TaxonomyResolver::new(mode);
    let mut report = SyncReport::default();
    for record in records {
        match sync_record(
            documents,
            terms,
            blobs,
            aliases,
            &resolver,
            mode,
            record,
            diagnostics,
        ) {
            Ok(RecordAction::Created) => report.created += 1,
            Ok(RecordAction::Updated) => report.updated += 1,
            Err(err) => {
                error!(
                    external_id = record.external_id.as_str(),
                    "record sync failed: {err:#}"
                );
                diagnostics.record_failure(
                    &record.external_id,
                    steps::UPSERT_DOCUMENT,
                    format!("sync failed: {err:#}"),
                );
            }
        }
    }
    report
}

#[allow(clippy::too_many_arguments)]
fn sync_record(
    documents: &mut dyn DocumentStore,
    terms: &mut dyn TermStore,
    blobs: &mut dyn BlobStore,
    aliases: &mut dyn AliasStore,
    resolver: &TaxonomyResolver,
    mode: SyncMode,
    record: &ArticleRecord,
    diagnostics: &mut DiagnosticsLog,
) -> Result<RecordAction> {
    let external_id = record.external_id.as_str();

    let existing = documents.find_by_external_id(KNOWLEDGE_BASE_TYPE, external_id)?;
    let (created_date, modified_date) = normalize_dates(record, diagnostics);
    let brand_division_term = resolver.resolve_brand_division(
        terms,
        &record.brand_division,
        external_id,
        steps::BRAND_DIVISION_TERM,
        diagnostics,
    );
    let product_terms = resolver.resolve_many(
        terms,
        &record.category_names,
        PRODUCTS_VOCABULARY,
        external_id,
        steps::PRODUCT_TERMS,
        diagnostics,
    );

    let (body_html, server_type_term, product_type_term, state) = match &record.payload {
        RecordPayload::Technote(fields) => {
            let server_type_term = resolve_variant_term(
                resolver,
                terms,
                &fields.server_types,
                SERVER_TYPES_VOCABULARY,
                external_id,
                steps::SERVER_TYPE_TERM,
                diagnostics,
            );
            let product_type_term = resolve_variant_term(
                resolver,
                terms,
                &fields.product_types,
                PRODUCT_TYPES_VOCABULARY,
                external_id,
                steps::PRODUCT_TYPE_TERM,
                diagnostics,
            );
            let attachments_html = persist_attachments(blobs, record, fields, diagnostics);
            let body = format!("{}{}", fields.details, attachments_html);
            let state = derive_technote_state(
                &TechnotePublishInputs {
                    publish_status: &record.publish_status,
                    details_empty: fields.details.is_empty(),
                    server_type_resolved: server_type_term.is_some(),
                    product_type_resolved: product_type_term.is_some(),
                    mode,
                },
                external_id,
                diagnostics,
            );
            (body, server_type_term, product_type_term, state)
        }
        RecordPayload::ErrorCode(fields) => {
            let body = build_error_code_table(fields);
            let state = derive_error_code_state(
                &record.publish_status,
                fields.causes_solutions.is_empty(),
                external_id,
                diagnostics,
            );
            (body, None, None, state)
        }
    };

    let (action, document_ids) = if existing.is_empty() {
        let content_type_term =
            resolve_content_type_term(resolver, terms, record, diagnostics);
        let document = documents.create(NewDocument {
            document_type: KNOWLEDGE_BASE_TYPE.to_string(),
            external_id: record.external_id.clone(),
            title: record.title.clone(),
            body_html: body_html.clone(),
            content_type_term,
            brand_division_term,
            product_terms: product_terms.clone(),
            server_type_term,
            product_type_term,
            source_created_date: created_date.clone(),
            source_modified_date: modified_date.clone(),
            published: state.is_published(),
            owner_uid: SYSTEM_OWNER_UID,
        })?;
        info!(external_id, document_id = document.id, "document created");
        (RecordAction::Created, vec![document.id])
    } else {
        for id in &existing {
            let Some(mut document) = documents.load(*id)? else {
                continue;
            };
            document.title = record.title.clone();
            document.body_html = body_html.clone();
            document.brand_division_term = brand_division_term;
            document.product_terms = product_terms.clone();
            document.server_type_term = server_type_term;
            document.product_type_term = product_type_term;
            document.source_created_date = created_date.clone();
            document.source_modified_date = modified_date.clone();
            document.published = state.is_published();
            documents.save(&document)?;
        }
        info!(
            external_id,
            documents = existing.len(),
            "documents updated"
        );
        (RecordAction::Updated, existing)
    };

    write_alias(aliases, record, &document_ids, diagnostics);
    diagnostics.record_success(external_id, steps::UPSERT_DOCUMENT);
    Ok(action)
}

/// Variant term lookups carry no per-miss diagnostic; the publish-state
/// rules react to unresolved terms instead.
fn resolve_variant_term(
    resolver: &TaxonomyResolver,
    terms: &mut dyn TermStore,
    value: &str,
    vocabulary: &str,
    external_id: &str,
    step: &str,
    diagnostics: &mut DiagnosticsLog,
) -> Option<TermId> {
    match resolver.resolve(terms, value, vocabulary) {
        Ok(id) => id,
        Err(err) => {
            diagnostics.record_failure(external_id, step, format!("term lookup failed: {err:#}"));
            None
        }
    }
}

fn resolve_content_type_term(
    resolver: &TaxonomyResolver,
    terms: &mut dyn TermStore,
    record: &ArticleRecord,
    diagnostics: &mut DiagnosticsLog,
) -> Option<TermId> {
    let external_id = record.external_id.as_str();
    let name = record.content_type_name();
    match resolver.resolve(terms, name, CONTENT_TYPE_VOCABULARY) {
        Ok(Some(id)) => {
            diagnostics.record_success(external_id, steps::CONTENT_TYPE_TERM);
            Some(id)
        }
        Ok(None) => {
            diagnostics.record_failure(
                external_id,
                steps::CONTENT_TYPE_TERM,
                format!("content type term {name:?} not found"),
            );
            None
        }
        Err(err) => {
            diagnostics.record_failure(
                external_id,
                steps::CONTENT_TYPE_TERM,
                format!("content type lookup failed: {err:#}"),
            );
            None
        }
    }
}

/// Decode the attachment slots into the blob store and render the download
/// list appended to the technote body. The list wrapper is always present,
/// even with no attachments.
fn persist_attachments(
    blobs: &mut dyn BlobStore,
    record: &ArticleRecord,
    fields: &TechnoteFields,
    diagnostics: &mut DiagnosticsLog,
) -> String {
    let mut html = String::from("<ul>");
    let mut failures = Vec::new();
    for attachment in &fields.attachments {
        match store_attachment(blobs, &record.external_id, attachment) {
            Ok(url) => {
                html.push_str(&format!(
                    r#"<li><a href="{url}" target="_blank">{}</a></li>"#,
                    attachment.name
                ));
            }
            Err(err) => failures.push(format!("{}: {err:#}", attachment.name)),
        }
    }
    html.push_str("</ul>");

    if failures.is_empty() {
        diagnostics.record_success(&record.external_id, steps::PERSIST_ATTACHMENTS);
    } else {
        diagnostics.record_failure(
            &record.external_id,
            steps::PERSIST_ATTACHMENTS,
            failures.join("; "),
        );
    }
    html
}

fn store_attachment(
    blobs: &mut dyn BlobStore,
    external_id: &str,
    attachment: &AttachmentData,
) -> Result<String> {
    // Bodies arrive JSON-escaped from the exporter; undo that before
    // decoding, and drop the line wrapping some exports carry.
    let unescaped = attachment.base64_body.replace("\\/", "/");
    let cleaned: String = unescaped.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD
        .decode(cleaned.as_bytes())
        .context("attachment body is not valid base64")?;
    blobs.write_file(external_id, &attachment.name, &bytes)
}

/// Error-code bodies are a fixed-order table of labeled rows; rows whose
/// value is empty (including an error number of 0) are omitted entirely.
pub fn build_error_code_table(fields: &ErrorCodeFields) -> String {
    let error_number = if fields.error_number == 0 {
        String::new()
    } else {
        fields.error_number.to_string()
    };
    let rows: [(&str, &str); 5] = [
        ("Error Message no.", error_number.as_str()),
        ("Message text", fields.message.as_str()),
        ("Severity", fields.severity.as_str()),
        ("Recovery Text", fields.causes_solutions.as_str()),
        ("How to Video", fields.how_to_video.as_str()),
    ];

    let mut table = String::from("<table>");
    for (label, value) in rows {
        if !value.is_empty() {
            table.push_str(&format!("<tr><td>{label}</td><td>{value}</td></tr>"));
        }
    }
    table.push_str("</table>");
    table
}

/// Alias prefix is decided by brand division: Datacard articles live under
/// the hardware tree, ECS and unbranded articles under ssl, and anything
/// else gets no alias at all.
pub fn compute_alias(brand_division: &str, url_name: &str) -> Option<String> {
    let url_name = url_name.to_lowercase();
    match brand_division {
        "Datacard" => Some(format!("/knowledgebase/hardware/{url_name}")),
        "ECS" | "" => Some(format!("/knowledgebase/ssl/{url_name}")),
        _ => None,
    }
}

pub fn document_path(id: DocumentId) -> String {
    format!("/document/{id}")
}

fn write_alias(
    aliases: &mut dyn AliasStore,
    record: &ArticleRecord,
    document_ids: &[DocumentId],
    diagnostics: &mut DiagnosticsLog,
) {
    let external_id = record.external_id.as_str();
    match compute_alias(&record.brand_division, &record.url_name) {
        Some(alias) => {
            diagnostics.record_success(external_id, steps::GENERATE_ALIAS);
            let mut failures = Vec::new();
            for id in document_ids {
                let path = document_path(*id);
                if let Err(err) = aliases.create_alias(&path, &alias) {
                    failures.push(format!("{path}: {err:#}"));
                }
            }
            if failures.is_empty() {
                diagnostics.record_success(external_id, steps::SAVE_ALIAS);
            } else {
                diagnostics.record_failure(external_id, steps::SAVE_ALIAS, failures.join("; "));
            }
        }
        None => {
            diagnostics.record_failure(
                external_id,
                steps::GENERATE_ALIAS,
                format!(
                    "no alias rule for brand division {:?}",
                    record.brand_division
                ),
            );
        }
    }
}

/// Both source dates must be present and parseable; otherwise the stored
/// dates stay empty and the ledger says why.
fn normalize_dates(record: &ArticleRecord, diagnostics: &mut DiagnosticsLog) -> (String, String) {
    let external_id = record.external_id.as_str();
    if record.created_date.is_empty() || record.last_modified_date.is_empty() {
        diagnostics.record_failure(
            external_id,
            steps::FORMAT_DATES,
            "CreatedDate or LastModifiedDate is empty",
        );
        return (String::new(), String::new());
    }

    match (
        parse_source_date(&record.created_date),
        parse_source_date(&record.last_modified_date),
    ) {
        (Some(created), Some(modified)) => {
            diagnostics.record_success(external_id, steps::FORMAT_DATES);
            (created, modified)
        }
        _ => {
            diagnostics.record_failure(
                external_id,
                steps::FORMAT_DATES,
                format!(
                    "unparseable source dates: {:?} / {:?}",
                    record.created_date, record.last_modified_date
                ),
            );
            (String::new(), String::new())
        }
    }
}

/// Normalize a source timestamp to `%Y-%m-%dT%H:%M:%S`, keeping the wall
/// time the exporter sent.
pub fn parse_source_date(value: &str) -> Option<String> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.format(OUTPUT_DATE_FORMAT).to_string());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%dT%H:%M:%S%z"] {
        if let Ok(parsed) = DateTime::parse_from_str(value, format) {
            return Some(parsed.format(OUTPUT_DATE_FORMAT).to_string());
        }
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Some(parsed.format(OUTPUT_DATE_FORMAT).to_string());
        }
    }
    None
}
