mod metadata;
mod records;

pub use metadata::parse_standard_names;
pub use records::{
    decode_all, reply_code, reply_text, DecodedBatch, RecordDecoder, NO_RECORDS_REPLY_CODE,
};
