use std::io::BufRead;

use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::models::{columns, FieldValue, PropertyRecord, PropertyType};

const LISTING_TAG: &str = "Listing";

enum Token {
    Open(String),
    Leaf(String),
    Close(String),
    Text(String),
    Eof,
    Skip,
}

fn local_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Outside,
    InRecordTag,
    InListingBlock,
}

/// Pull decoder turning a search response into listing records.
///
/// Records are produced one at a time as each `<{PropertyType}>` element
/// closes, so the document is never held in memory as a whole. After an
/// error the decoder is exhausted; records already yielded stay valid.
pub struct RecordDecoder<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    template: PropertyRecord,
    property_type: PropertyType,
    state: State,
    current: PropertyRecord,
    current_field: Option<String>,
    finished: bool,
}

impl<R: BufRead> RecordDecoder<R> {
    pub fn new(source: R, template: PropertyRecord, property_type: PropertyType) -> Self {
        let mut reader = Reader::from_reader(source);
        reader.config_mut().trim_text(true);

        Self {
            reader,
            buf: Vec::new(),
            template,
            property_type,
            state: State::Outside,
            current: PropertyRecord::new(),
            current_field: None,
            finished: false,
        }
    }

    fn assign(&mut self, text: &str) {
        if self.state != State::InListingBlock || text.is_empty() {
            return;
        }
        if let Some(field) = &self.current_field {
            self.current
                .set(field.clone(), FieldValue::from_feed_text(text));
        }
    }

    fn finish_record(&mut self) -> PropertyRecord {
        let mut record = std::mem::take(&mut self.current);
        record.set(
            columns::PROPERTY_TYPE,
            FieldValue::Text(self.property_type.as_str().to_string()),
        );

        for (wrong, right) in self.property_type.field_corrections() {
            if record.rename(wrong, right) {
                debug!(
                    property_type = %self.property_type,
                    field = wrong,
                    "corrected misspelled feed field"
                );
            }
        }
        record
    }

    fn next_token(&mut self) -> Result<Token> {
        self.buf.clear();
        let position = self.reader.buffer_position() as u64;
        let parse_error = |message: String| SyncError::Parse { position, message };

        let token = match self.reader.read_event_into(&mut self.buf) {
            Ok(Event::Start(e)) => Token::Open(local_name(e.local_name().as_ref())),
            Ok(Event::Empty(e)) => Token::Leaf(local_name(e.local_name().as_ref())),
            Ok(Event::End(e)) => Token::Close(local_name(e.local_name().as_ref())),
            Ok(Event::Text(t)) => Token::Text(
                t.unescape()
                    .map_err(|e| parse_error(e.to_string()))?
                    .trim()
                    .to_string(),
            ),
            Ok(Event::CData(c)) => {
                Token::Text(String::from_utf8_lossy(&c).trim().to_string())
            }
            Ok(Event::Eof) => Token::Eof,
            Ok(_) => Token::Skip,
            Err(e) => return Err(parse_error(e.to_string())),
        };
        Ok(token)
    }

    fn step(&mut self) -> Option<Result<PropertyRecord>> {
        let tag = self.property_type.as_str();

        loop {
            let token = match self.next_token() {
                Ok(token) => token,
                Err(e) => return Some(Err(e)),
            };

            match token {
                Token::Open(name) => {
                    if name == tag {
                        self.current = self.template.clone();
                        self.state = State::InRecordTag;
                    } else if self.state == State::InRecordTag && name == LISTING_TAG {
                        self.state = State::InListingBlock;
                    }
                    self.current_field = Some(name);
                }
                Token::Leaf(name) => self.current_field = Some(name),
                Token::Text(text) => self.assign(&text),
                Token::Close(name) => {
                    if name == tag && self.state != State::Outside {
                        self.state = State::Outside;
                        return Some(Ok(self.finish_record()));
                    } else if self.state == State::InListingBlock && name == LISTING_TAG {
                        self.state = State::InRecordTag;
                    }
                }
                Token::Eof => {
                    if self.state != State::Outside {
                        return Some(Err(SyncError::Parse {
                            position: self.reader.buffer_position() as u64,
                            message: format!("document ended inside <{tag}>"),
                        }));
                    }
                    return None;
                }
                Token::Skip => {}
            }
        }
    }
}

impl<R: BufRead> Iterator for RecordDecoder<R> {
    type Item = Result<PropertyRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let item = self.step();
        if !matches!(item, Some(Ok(_))) {
            self.finished = true;
        }
        item
    }
}

/// Records of one document plus the MLS index in document order.
///
/// `fault` holds the error that stopped decoding early; the records before it
/// are complete and usable.
#[derive(Debug, Default)]
pub struct DecodedBatch {
    pub records: Vec<PropertyRecord>,
    pub mls_index: Vec<String>,
    pub fault: Option<SyncError>,
}

impl DecodedBatch {
    /// The batch, or its fault when the document could not be read to the end.
    pub fn into_complete(self) -> Result<Self> {
        match self.fault {
            Some(fault) => Err(fault),
            None => Ok(self),
        }
    }
}

/// Decodes a whole response, stopping at the first malformed fragment.
pub fn decode_all(
    xml: &str,
    template: &PropertyRecord,
    property_type: PropertyType,
) -> DecodedBatch {
    let started = std::time::Instant::now();
    let mut batch = DecodedBatch::default();

    for record in RecordDecoder::new(xml.as_bytes(), template.clone(), property_type) {
        match record {
            Ok(record) => {
                if let Some(mls) = record.mls() {
                    batch.mls_index.push(mls);
                }
                batch.records.push(record);
            }
            Err(e) => {
                warn!(
                    %property_type,
                    decoded = batch.records.len(),
                    error = %e,
                    "stopped decoding feed document"
                );
                batch.fault = Some(e);
                break;
            }
        }
    }

    info!(
        %property_type,
        count = batch.records.len(),
        complete = batch.fault.is_none(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "decoded feed document"
    );
    batch
}

/// Reply code the feed sends when a search matched nothing.
pub const NO_RECORDS_REPLY_CODE: &str = "20201";

fn reply_attribute<'a>(xml: &'a str, name: &str) -> Option<&'a str> {
    let marker = format!("{name}=\"");
    let start = xml.find(&marker)? + marker.len();
    let len = xml[start..].find('"')?;
    Some(&xml[start..start + len])
}

/// Extracts the `ReplyCode` attribute of a RETS response, if present.
pub fn reply_code(xml: &str) -> Option<&str> {
    reply_attribute(xml, "ReplyCode")
}

/// Extracts the `ReplyText` attribute of a RETS response, if present.
pub fn reply_text(xml: &str) -> Option<&str> {
    reply_attribute(xml, "ReplyText")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> PropertyRecord {
        ["MLS", "ListPrice", "Pool", "Sewers", "BuildingAmenties1"]
            .into_iter()
            .map(|f| (f.to_string(), FieldValue::Null))
            .collect()
    }

    const RESIDENTIAL: &str = r#"<?xml version="1.0"?>
<RETS ReplyCode="0" ReplyText="Operation Successful">
  <COUNT Records="2"/>
  <REData>
    <ResidentialProperty>
      <Listing>
        <MLS>W100</MLS>
        <ListPrice>799000</ListPrice>
        <Pool>Y</Pool>
        <Sewers>null</Sewers>
        <Elevator>N</Elevator>
      </Listing>
    </ResidentialProperty>
    <ResidentialProperty>
      <Listing>
        <MLS>W200</MLS>
        <ListPrice>1150000</ListPrice>
        <Pool>N</Pool>
        <Sewers>Municipal &amp; Septic</Sewers>
      </Listing>
    </ResidentialProperty>
  </REData>
</RETS>"#;

    #[test]
    fn decodes_records_with_canonical_values() {
        let batch = decode_all(RESIDENTIAL, &template(), PropertyType::Residential)
            .into_complete()
            .unwrap();
        assert_eq!(batch.mls_index, vec!["W100", "W200"]);

        let first = &batch.records[0];
        assert_eq!(first.get("Pool"), Some(&FieldValue::Int(1)));
        assert_eq!(first.get("Elevator"), Some(&FieldValue::Int(0)));
        assert_eq!(first.get("Sewers"), Some(&FieldValue::Null));
        assert_eq!(first.text("ListPrice").as_deref(), Some("799000"));

        let second = &batch.records[1];
        assert_eq!(second.get("Pool"), Some(&FieldValue::Int(0)));
        assert_eq!(
            second.text("Sewers").as_deref(),
            Some("Municipal & Septic")
        );
        // template default survives when the feed omits the field
        assert_eq!(second.get("Elevator"), None);
        assert_eq!(second.get("BuildingAmenties1"), Some(&FieldValue::Null));
    }

    #[test]
    fn never_keeps_the_literal_null_string() {
        let batch = decode_all(RESIDENTIAL, &template(), PropertyType::Residential)
            .into_complete()
            .unwrap();
        for record in &batch.records {
            for (_, value) in record.iter() {
                assert_ne!(value, &FieldValue::Text("null".into()));
                assert_ne!(value, &FieldValue::Text("Y".into()));
                assert_ne!(value, &FieldValue::Text("N".into()));
            }
        }
    }

    #[test]
    fn stamps_property_type_on_every_record() {
        let batch = decode_all(RESIDENTIAL, &template(), PropertyType::Residential)
            .into_complete()
            .unwrap();
        assert_eq!(batch.records.len(), 2);
        for record in &batch.records {
            assert_eq!(
                record.text(columns::PROPERTY_TYPE).as_deref(),
                Some("ResidentialProperty")
            );
        }
    }

    #[test]
    fn ignores_elements_of_other_classes() {
        let batch = decode_all(RESIDENTIAL, &template(), PropertyType::Condo)
            .into_complete()
            .unwrap();
        assert!(batch.records.is_empty());
    }

    #[test]
    fn corrects_condo_amenity_field_names() {
        let xml = r#"<RETS><REData><CondoProperty><Listing>
            <MLS>C1</MLS>
            <BuildingAmenities1>Gym</BuildingAmenities1>
        </Listing></CondoProperty></REData></RETS>"#;

        let batch = decode_all(xml, &template(), PropertyType::Condo)
            .into_complete()
            .unwrap();
        let record = &batch.records[0];
        assert_eq!(record.text("BuildingAmenties1").as_deref(), Some("Gym"));
        assert!(record.get("BuildingAmenities1").is_none());
    }

    #[test]
    fn malformed_fragment_keeps_earlier_records() {
        let xml = r#"<RETS><REData>
            <ResidentialProperty><Listing><MLS>OK1</MLS></Listing></ResidentialProperty>
            <ResidentialProperty><Listing><MLS>BAD</Pool></Listing></ResidentialProperty>
        </REData></RETS>"#;

        let mut decoder = RecordDecoder::new(xml.as_bytes(), template(), PropertyType::Residential);
        let first = decoder.next().unwrap().unwrap();
        assert_eq!(first.mls().as_deref(), Some("OK1"));
        assert!(matches!(decoder.next(), Some(Err(SyncError::Parse { .. }))));
        assert!(decoder.next().is_none());

        let batch = decode_all(xml, &template(), PropertyType::Residential);
        assert_eq!(batch.mls_index, vec!["OK1"]);
        assert_eq!(batch.records.len(), 1);
        assert!(matches!(batch.fault, Some(SyncError::Parse { .. })));
        assert!(matches!(batch.into_complete(), Err(SyncError::Parse { .. })));
    }

    #[test]
    fn truncated_document_is_a_parse_error() {
        let xml = "<RETS><ResidentialProperty><Listing><MLS>X</MLS>";
        let batch = decode_all(xml, &template(), PropertyType::Residential);
        assert!(batch.records.is_empty());
        assert!(matches!(batch.fault, Some(SyncError::Parse { .. })));
    }

    #[test]
    fn reads_reply_code() {
        let empty = r#"<RETS ReplyCode="20201" ReplyText="No Records Found." ></RETS>"#;
        assert_eq!(reply_code(empty), Some(NO_RECORDS_REPLY_CODE));
        assert_eq!(reply_code(RESIDENTIAL), Some("0"));
        assert_eq!(reply_code("<RETS/>"), None);
        assert_eq!(reply_text(empty), Some("No Records Found."));
    }
}
