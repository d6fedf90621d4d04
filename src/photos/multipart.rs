use std::sync::LazyLock;

use regex::bytes::Regex as BytesRegex;
use regex::Regex;

static BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"boundary="?([^\s;"]+)"?"#).expect("valid boundary regex"));
static IMAGE_TYPE: LazyLock<BytesRegex> = LazyLock::new(|| {
    BytesRegex::new(r"(?im)^Content-Type:\s*image/(jpeg|png)").expect("valid content type regex")
});
static CONTENT_ID: LazyLock<BytesRegex> =
    LazyLock::new(|| BytesRegex::new(r"(?im)^Content-ID:\s*(\S+)").expect("valid content id regex"));
static OBJECT_ID: LazyLock<BytesRegex> =
    LazyLock::new(|| BytesRegex::new(r"(?im)^Object-ID:\s*(\S+)").expect("valid object id regex"));

const HEADER_END: &[u8] = b"\r\n\r\n";

/// Image encodings the feed serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
}

impl ImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
        }
    }
}

/// One image extracted from a multipart photo response.
#[derive(Debug, PartialEq, Eq)]
pub struct ImagePart<'a> {
    /// Listing key the image belongs to.
    pub content_id: String,
    /// Sequence number of the image within the listing.
    pub object_id: String,
    pub format: ImageFormat,
    pub data: &'a [u8],
}

impl ImagePart<'_> {
    pub fn file_name(&self) -> String {
        format!(
            "{}-{}.{}",
            self.content_id,
            self.object_id,
            self.format.extension()
        )
    }
}

/// Boundary token from a `multipart/...; boundary=...` content type.
pub fn boundary(content_type: &str) -> Option<&str> {
    BOUNDARY
        .captures(content_type)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

/// Splits a multipart body on `\r\n--{boundary}` delimiters, dropping the
/// preamble and the closing `--`.
///
/// The CRLF ahead of each delimiter belongs to the delimiter, so parts end
/// exactly where their content ends. Only the first delimiter may open the
/// body without a CRLF in front of it.
pub fn split_parts<'a>(body: &'a [u8], boundary: &str) -> Vec<&'a [u8]> {
    let delimiter = format!("\r\n--{boundary}");
    let delimiter = delimiter.as_bytes();
    let bare = &delimiter[2..];

    let mut parts = Vec::new();
    let mut start = if body.starts_with(bare) {
        bare.len()
    } else {
        match find(body, delimiter, 0) {
            Some(at) => at + delimiter.len(),
            None => return parts,
        }
    };

    loop {
        if body[start..].starts_with(b"--") {
            break;
        }
        match find(body, delimiter, start) {
            Some(next) => {
                parts.push(&body[start..next]);
                start = next + delimiter.len();
            }
            None => {
                parts.push(&body[start..]);
                break;
            }
        }
    }
    parts
}

fn header_value(re: &BytesRegex, headers: &[u8]) -> Option<String> {
    re.captures(headers)
        .and_then(|c| c.get(1))
        .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
}

/// Extracts the image carried by one part; `None` for non-image parts.
pub fn parse_image_part(part: &[u8]) -> Option<ImagePart<'_>> {
    let part = part.strip_prefix(b"\r\n").unwrap_or(part);
    let header_end = find(part, HEADER_END, 0)?;
    let headers = &part[..header_end];

    let subtype = IMAGE_TYPE.captures(headers)?.get(1)?.as_bytes();
    let format = if subtype.eq_ignore_ascii_case(b"png") {
        ImageFormat::Png
    } else {
        ImageFormat::Jpeg
    };
    let content_id = header_value(&CONTENT_ID, headers)?;
    let object_id = header_value(&OBJECT_ID, headers)?;

    let data = &part[header_end + HEADER_END.len()..];

    Some(ImagePart {
        content_id,
        object_id,
        format,
        data,
    })
}
