use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::info;

use crate::error::{Result, SyncError};
use crate::models::columns;

const STANDARD_NAME_TAG: &[u8] = b"StandardName";

/// Collects the `StandardName` of every field in a `METADATA-TABLE` response.
///
/// `MLS` and `TimestampSql` are always present and skipped. Names the feed
/// splits over several words are joined back into one identifier.
pub fn parse_standard_names(xml: &str) -> Result<Vec<String>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut names = Vec::new();
    let mut inside = false;

    loop {
        let position = reader.buffer_position() as u64;
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == STANDARD_NAME_TAG => inside = true,
            Ok(Event::End(e)) if e.local_name().as_ref() == STANDARD_NAME_TAG => inside = false,
            Ok(Event::Text(t)) if inside => {
                let text = t.unescape().map_err(|e| SyncError::Parse {
                    position,
                    message: e.to_string(),
                })?;
                let name: String = text.split_whitespace().collect();
                if !name.is_empty() && name != columns::MLS && name != columns::TIMESTAMP_SQL {
                    names.push(name);
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(SyncError::Parse {
                    position,
                    message: e.to_string(),
                })
            }
        }
    }

    info!(count = names.len(), "parsed metadata field names");
    Ok(names)
}
