use std::collections::HashMap;

use quick_xml::events::Event;
use quick_xml::reader::Reader;
use thiserror::Error;

use crate::diagnostics::DiagnosticsLog;
use crate::html::{self, NormalizeContext};
use crate::mirror::ImageMirror;

pub const TECHNOTE_ROOT: &str = "Technote__kavList";
pub const ERROR_CODE_ROOT: &str = "Error_Code__kavList";

const TECHNOTE_ENTRY: &str = "Technote__kav";
const ERROR_CODE_ENTRY: &str = "Error_Code__kav";

const CATEGORY_CONTAINER: &str = "DataCategorySelections";
const CATEGORY_SELECTION_SUFFIX: &str = "__DataCategorySelection";
const PRODUCT_FAMILY_GROUP: &str = "Product_Family";

const ATTACHMENT_SLOTS: usize = 3;

/// The payload was not well-formed XML. Carries the reader's diagnostics
/// for the 400 response body.
#[derive(Debug, Error)]
#[error("XML parsing error: {}", diagnostics.join("; "))]
pub struct ParseError {
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentData {
    pub name: String,
    pub content_type: String,
    pub base64_body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategorySelection {
    pub group_name: String,
    pub category_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TechnoteFields {
    pub details: String,
    pub summary: String,
    pub reference_number: String,
    pub problem: String,
    pub module_name: String,
    pub error_code_ref: String,
    pub service_code: String,
    pub server_types: String,
    pub technote_types: String,
    pub product_types: String,
    pub attachments: Vec<AttachmentData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorCodeFields {
    pub error_number: i64,
    pub message: String,
    pub severity: String,
    pub causes_solutions: String,
    pub how_to_video: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordPayload {
    Technote(TechnoteFields),
    ErrorCode(ErrorCodeFields),
}

/// One parsed feed entry. Transient: constructed fresh per request and
/// mapped onto a stored document by the sync engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleRecord {
    pub external_id: String,
    pub title: String,
    pub language: String,
    pub url_name: String,
    pub brand_division: String,
    pub created_date: String,
    pub last_modified_date: String,
    pub publish_status: String,
    pub category_names: Vec<String>,
    pub payload: RecordPayload,
}

impl ArticleRecord {
    /// Name of the content-type taxonomy term for this variant.
    pub fn content_type_name(&self) -> &'static str {
        match self.payload {
            RecordPayload::Technote(_) => "Tech Note",
            RecordPayload::ErrorCode(_) => "Error Code",
        }
    }
}

#[derive(Debug)]
pub enum ParsedPayload {
    Records {
        records: Vec<ArticleRecord>,
        category_selections: Vec<CategorySelection>,
    },
    /// Well-formed XML whose root is neither variant; a no-op, not an error.
    UnknownRoot { root: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RootKind {
    Technote,
    ErrorCode,
}

impl RootKind {
    fn from_root(name: &str) -> Option<Self> {
        match name {
            TECHNOTE_ROOT => Some(Self::Technote),
            ERROR_CODE_ROOT => Some(Self::ErrorCode),
            _ => None,
        }
    }

    fn entry_name(self) -> &'static str {
        match self {
            Self::Technote => TECHNOTE_ENTRY,
            Self::ErrorCode => ERROR_CODE_ENTRY,
        }
    }
}

/// Parse one feed payload. Rich-text fields run through the HTML
/// normalizer before landing on the record; the mirror collaborator is
/// forwarded so development-mode requests localize images during that
/// pass.
pub fn parse_payload(
    bytes: &[u8],
    mut mirror: Option<&mut ImageMirror>,
    diagnostics: &mut DiagnosticsLog,
) -> Result<ParsedPayload, ParseError> {
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::new();

    let mut stack: Vec<String> = Vec::new();
    let mut text_stack: Vec<String> = Vec::new();

    let mut root: Option<String> = None;
    let mut kind: Option<RootKind> = None;

    let mut records: Vec<ArticleRecord> = Vec::new();
    let mut all_selections: Vec<CategorySelection> = Vec::new();

    let mut entry_fields: Option<HashMap<String, String>> = None;
    let mut entry_selections: Vec<CategorySelection> = Vec::new();
    let mut pending_group: Option<String> = None;
    let mut pending_category: Option<String> = None;

    loop {
        let event = match reader.read_event_into(&mut buf) {
            Ok(event) => event,
            Err(error) => {
                return Err(ParseError {
                    diagnostics: vec![format!(
                        "error at byte {}: {error}",
                        reader.buffer_position()
                    )],
                });
            }
        };

        match event {
            Event::Start(ref e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if stack.is_empty() {
                    kind = RootKind::from_root(&name);
                    root = Some(name.clone());
                } else if let Some(kind) = kind
                    && name == kind.entry_name()
                    && stack.len() == 1
                {
                    entry_fields = Some(HashMap::new());
                    entry_selections = Vec::new();
                }
                stack.push(name);
                text_stack.push(String::new());
            }
            Event::Text(ref e) => {
                if let Some(text) = text_stack.last_mut() {
                    match e.unescape() {
                        Ok(value) => text.push_str(&value),
                        Err(_) => text.push_str(&String::from_utf8_lossy(e.as_ref())),
                    }
                }
            }
            Event::CData(ref e) => {
                if let Some(text) = text_stack.last_mut() {
                    text.push_str(&String::from_utf8_lossy(e.as_ref()));
                }
            }
            Event::Empty(ref e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if stack.is_empty() {
                    // A self-closed root, e.g. `<Foo/>`.
                    kind = RootKind::from_root(&name);
                    root = Some(name);
                } else if let (Some(fields), Some(kind)) = (entry_fields.as_mut(), kind)
                    && stack.last().map(String::as_str) == Some(kind.entry_name())
                {
                    fields.insert(name, String::new());
                }
            }
            Event::End(ref e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                let text = text_stack.pop().unwrap_or_default();
                if stack.pop().as_deref() != Some(name.as_str()) {
                    return Err(ParseError {
                        diagnostics: vec![format!(
                            "error at byte {}: mismatched closing tag </{name}>",
                            reader.buffer_position()
                        )],
                    });
                }

                let parent = stack.last().map(String::as_str);
                match name.as_str() {
                    "DataCategoryGroupName" => pending_group = Some(text.trim().to_string()),
                    "DataCategoryName" => pending_category = Some(text.trim().to_string()),
                    CATEGORY_CONTAINER => {}
                    _ if name.ends_with(CATEGORY_SELECTION_SUFFIX) => {
                        if let (Some(group_name), Some(category_name)) =
                            (pending_group.take(), pending_category.take())
                        {
                            let selection = CategorySelection {
                                group_name,
                                category_name,
                            };
                            entry_selections.push(selection.clone());
                            all_selections.push(selection);
                        }
                    }
                    _ => {
                        if let Some(kind) = kind
                            && name == kind.entry_name()
                        {
                            if let Some(fields) = entry_fields.take() {
                                records.push(build_record(
                                    kind,
                                    &fields,
                                    &entry_selections,
                                    mirror.as_deref_mut(),
                                    diagnostics,
                                ));
                            }
                        } else if let (Some(fields), Some(kind)) = (entry_fields.as_mut(), kind)
                            && parent == Some(kind.entry_name())
                        {
                            fields.insert(name.clone(), text.trim().to_string());
                        }
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if let Some(open) = stack.last() {
        return Err(ParseError {
            diagnostics: vec![format!("unexpected end of document; <{open}> is not closed")],
        });
    }

    let Some(root) = root else {
        return Err(ParseError {
            diagnostics: vec!["document has no root element".to_string()],
        });
    };

    if kind.is_none() {
        return Ok(ParsedPayload::UnknownRoot { root });
    }

    Ok(ParsedPayload::Records {
        records,
        category_selections: all_selections,
    })
}

fn build_record(
    kind: RootKind,
    fields: &HashMap<String, String>,
    selections: &[CategorySelection],
    mirror: Option<&mut ImageMirror>,
    diagnostics: &mut DiagnosticsLog,
) -> ArticleRecord {
    let field = |name: &str| fields.get(name).cloned().unwrap_or_default();

    let external_id = field("Id");
    let title = field("Title");

    let category_names = selections
        .iter()
        .filter(|selection| selection.group_name == PRODUCT_FAMILY_GROUP)
        .map(|selection| selection.category_name.replace('_', " "))
        .collect();

    let payload = match kind {
        RootKind::Technote => {
            let raw_details = field("Detail_For_External_KB__c");
            let details = normalize_rich_text(&raw_details, &title, &external_id, mirror, diagnostics);
            RecordPayload::Technote(TechnoteFields {
                details,
                summary: field("Summary"),
                reference_number: field("Reference_Number__c"),
                problem: field("Problem_for_External_KB__c"),
                module_name: field("Modules__c"),
                error_code_ref: field("Error_Code__c"),
                service_code: field("Service_Code_s__c"),
                server_types: field("ECS_Server_Type__c"),
                technote_types: field("ECS_Technote_Type__c"),
                product_types: field("ECS_Product_Type__c"),
                attachments: collect_attachments(fields),
            })
        }
        RootKind::ErrorCode => {
            let raw_causes = field("Causes_Solutions_for_External_KB__c");
            let causes_solutions =
                normalize_rich_text(&raw_causes, &title, &external_id, mirror, diagnostics);
            RecordPayload::ErrorCode(ErrorCodeFields {
                error_number: coerce_integer(&field("Error_Number__c")),
                message: field("Error_Message__c"),
                severity: field("Severity__c"),
                causes_solutions,
                // The video embed only loses its inline styles; it skips
                // the rest of the pipeline.
                how_to_video: html::strip_style_attributes(&field("How_to_Videos__c")),
            })
        }
    };

    ArticleRecord {
        external_id,
        title,
        language: field("Language"),
        url_name: field("UrlName"),
        brand_division: field("Brand_Division__c"),
        created_date: field("CreatedDate"),
        last_modified_date: field("LastModifiedDate"),
        publish_status: field("PublishStatus"),
        category_names,
        payload,
    }
}

fn normalize_rich_text(
    raw: &str,
    title: &str,
    external_id: &str,
    mirror: Option<&mut ImageMirror>,
    diagnostics: &mut DiagnosticsLog,
) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let mut ctx = NormalizeContext {
        title,
        external_id,
        diagnostics,
        mirror,
    };
    html::normalize(raw, &mut ctx)
}

/// Keep only the attachment slots where name, content type, and body are
/// all present.
fn collect_attachments(fields: &HashMap<String, String>) -> Vec<AttachmentData> {
    let mut attachments = Vec::new();
    for slot in 1..=ATTACHMENT_SLOTS {
        let field = |part: &str| {
            fields
                .get(&format!("Attachment_{slot}__{part}__s"))
                .cloned()
                .unwrap_or_default()
        };
        let name = field("Name");
        let content_type = field("ContentType");
        let base64_body = field("Body");
        if !name.is_empty() && !content_type.is_empty() && !base64_body.is_empty() {
            attachments.push(AttachmentData {
                name,
                content_type,
                base64_body,
            });
        }
    }
    attachments
}

/// Leading-digit integer coercion: `"12abc"` → 12, `"x"` → 0.
pub(crate) fn coerce_integer(value: &str) -> i64 {
    let trimmed = value.trim();
    let bytes = trimmed.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end = 1;
    }
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    trimmed[..end].parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(bytes: &[u8]) -> Result<ParsedPayload, ParseError> {
        let mut diagnostics = DiagnosticsLog::new();
        parse_payload(bytes, None, &mut diagnostics)
    }

    const TECHNOTE_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Technote__kavList>
  <Technote__kav>
    <Id>ka0TN1</Id>
    <Title>Reset the reader</Title>
    <Language>en_US</Language>
    <UrlName>Reset-The-Reader</UrlName>
    <CreatedDate>2024-01-02T03:04:05.000Z</CreatedDate>
    <LastModifiedDate>2024-02-03T04:05:06.000Z</LastModifiedDate>
    <PublishStatus>Online</PublishStatus>
    <Brand_Division__c>ECS</Brand_Division__c>
    <Summary>How to reset</Summary>
    <Reference_Number__c>TN0001</Reference_Number__c>
    <Modules__c>Reader</Modules__c>
    <Error_Code__c>E100</Error_Code__c>
    <Service_Code_s__c>SVC1</Service_Code_s__c>
    <ECS_Server_Type__c>Apache</ECS_Server_Type__c>
    <ECS_Technote_Type__c>Install</ECS_Technote_Type__c>
    <ECS_Product_Type__c>TLS</ECS_Product_Type__c>
    <Problem_for_External_KB__c>It breaks</Problem_for_External_KB__c>
    <Detail_For_External_KB__c>&lt;p&gt;&lt;b&gt;Reset&lt;/b&gt; now&lt;/p&gt;</Detail_For_External_KB__c>
    <Attachment_1__Name__s>guide.pdf</Attachment_1__Name__s>
    <Attachment_1__ContentType__s>application/pdf</Attachment_1__ContentType__s>
    <Attachment_1__Body__s>YWJj</Attachment_1__Body__s>
    <Attachment_2__Name__s>orphan.pdf</Attachment_2__Name__s>
    <DataCategorySelections>
      <Technote__DataCategorySelection>
        <DataCategoryGroupName>Product_Family</DataCategoryGroupName>
        <DataCategoryName>TLS_SSL_Certificates</DataCategoryName>
      </Technote__DataCategorySelection>
      <Technote__DataCategorySelection>
        <DataCategoryGroupName>Other_Group</DataCategoryGroupName>
        <DataCategoryName>Ignored</DataCategoryName>
      </Technote__DataCategorySelection>
    </DataCategorySelections>
  </Technote__kav>
</Technote__kavList>"#;

    const ERROR_CODE_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Error_Code__kavList>
  <Error_Code__kav>
    <Id>ka0EC1</Id>
    <Title>Error 42</Title>
    <Language>en_US</Language>
    <UrlName>Error-42</UrlName>
    <Error_Number__c>42</Error_Number__c>
    <Error_Message__c>Widget failed</Error_Message__c>
    <Severity__c>High</Severity__c>
    <How_to_Videos__c>&lt;p style="color:red"&gt;&lt;font&gt;watch&lt;/font&gt;&lt;/p&gt;</How_to_Videos__c>
    <Causes_Solutions_for_External_KB__c>&lt;p style="margin:0"&gt;&lt;b&gt;Check&lt;/b&gt; the cable&lt;/p&gt;</Causes_Solutions_for_External_KB__c>
    <Brand_Division__c>Datacard</Brand_Division__c>
    <CreatedDate>2024-01-02T03:04:05.000Z</CreatedDate>
    <LastModifiedDate>2024-02-03T04:05:06.000Z</LastModifiedDate>
    <PublishStatus>Online</PublishStatus>
    <DataCategorySelections>
      <Error_Code__DataCategorySelection>
        <DataCategoryGroupName>Product_Family</DataCategoryGroupName>
        <DataCategoryName>Card_Printers</DataCategoryName>
      </Error_Code__DataCategorySelection>
    </DataCategorySelections>
  </Error_Code__kav>
</Error_Code__kavList>"#;

    #[test]
    fn technote_payload_parses_and_normalizes() {
        let parsed = parse(TECHNOTE_XML.as_bytes()).expect("parse");
        let ParsedPayload::Records {
            records,
            category_selections,
        } = parsed
        else {
            panic!("expected records");
        };
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.external_id, "ka0TN1");
        assert_eq!(record.title, "Reset the reader");
        assert_eq!(record.url_name, "Reset-The-Reader");
        assert_eq!(record.brand_division, "ECS");
        assert_eq!(record.publish_status, "Online");
        assert_eq!(record.category_names, vec!["TLS SSL Certificates"]);
        assert_eq!(record.content_type_name(), "Tech Note");
        assert_eq!(category_selections.len(), 2);

        let RecordPayload::Technote(fields) = &record.payload else {
            panic!("expected technote payload");
        };
        assert_eq!(fields.details, "<p><strong>Reset</strong> now</p>");
        assert_eq!(fields.summary, "How to reset");
        assert_eq!(fields.reference_number, "TN0001");
        assert_eq!(fields.server_types, "Apache");
        assert_eq!(fields.product_types, "TLS");
        // The second slot is missing its content type and body.
        assert_eq!(fields.attachments.len(), 1);
        assert_eq!(fields.attachments[0].name, "guide.pdf");
        assert_eq!(fields.attachments[0].content_type, "application/pdf");
        assert_eq!(fields.attachments[0].base64_body, "YWJj");
    }

    #[test]
    fn error_code_payload_parses_and_normalizes() {
        let parsed = parse(ERROR_CODE_XML.as_bytes()).expect("parse");
        let ParsedPayload::Records { records, .. } = parsed else {
            panic!("expected records");
        };
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.external_id, "ka0EC1");
        assert_eq!(record.brand_division, "Datacard");
        assert_eq!(record.category_names, vec!["Card Printers"]);
        assert_eq!(record.content_type_name(), "Error Code");

        let RecordPayload::ErrorCode(fields) = &record.payload else {
            panic!("expected error code payload");
        };
        assert_eq!(fields.error_number, 42);
        assert_eq!(fields.message, "Widget failed");
        assert_eq!(fields.severity, "High");
        assert_eq!(
            fields.causes_solutions,
            "<p><strong>Check</strong> the cable</p>"
        );
        // The video embed keeps everything but its style attributes.
        assert_eq!(fields.how_to_video, "<p><font>watch</font></p>");
    }

    #[test]
    fn unknown_root_is_a_no_op() {
        let parsed = parse(b"<Foo><Bar>x</Bar></Foo>").expect("parse");
        let ParsedPayload::UnknownRoot { root } = parsed else {
            panic!("expected unknown root");
        };
        assert_eq!(root, "Foo");
    }

    #[test]
    fn self_closed_unknown_root_is_a_no_op() {
        let parsed = parse(b"<Foo/>").expect("parse");
        let ParsedPayload::UnknownRoot { root } = parsed else {
            panic!("expected unknown root");
        };
        assert_eq!(root, "Foo");
    }

    #[test]
    fn malformed_xml_is_a_parse_error() {
        let error = parse(b"<Technote__kavList><Technote__kav>").expect_err("must fail");
        assert!(!error.diagnostics.is_empty());

        let error =
            parse(b"<Technote__kavList><a></b></Technote__kavList>").expect_err("must fail");
        assert!(!error.diagnostics.is_empty());
    }

    #[test]
    fn empty_document_is_a_parse_error() {
        assert!(parse(b"").is_err());
        assert!(parse(b"   ").is_err());
    }

    #[test]
    fn recognized_root_with_no_entries_yields_zero_records() {
        let parsed = parse(b"<Error_Code__kavList></Error_Code__kavList>").expect("parse");
        let ParsedPayload::Records { records, .. } = parsed else {
            panic!("expected records");
        };
        assert!(records.is_empty());
    }

    #[test]
    fn records_keep_document_order() {
        let xml = r#"<Error_Code__kavList>
            <Error_Code__kav><Id>first</Id><Title>a</Title></Error_Code__kav>
            <Error_Code__kav><Id>second</Id><Title>b</Title></Error_Code__kav>
        </Error_Code__kavList>"#;
        let ParsedPayload::Records { records, .. } = parse(xml.as_bytes()).expect("parse") else {
            panic!("expected records");
        };
        let ids: Vec<&str> = records
            .iter()
            .map(|record| record.external_id.as_str())
            .collect();
        assert_eq!(ids, vec!["first", "second"]);
    }

    #[test]
    fn integer_coercion_takes_leading_digits() {
        assert_eq!(coerce_integer("42"), 42);
        assert_eq!(coerce_integer(" 42 "), 42);
        assert_eq!(coerce_integer("12abc"), 12);
        assert_eq!(coerce_integer("-5"), -5);
        assert_eq!(coerce_integer("abc"), 0);
        assert_eq!(coerce_integer(""), 0);
    }
}
