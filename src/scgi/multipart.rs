use bytes::Bytes;
use std::collections::BTreeMap;

use super::error::Error;
use super::request::Values;

const MAX_PART_HEADERS: usize = 16;

/// An uploaded file from a multipart body
#[derive(Debug, Clone)]
pub struct FileHeader
{
    /// Base name of the file as sent by the client
    pub filename: String,
    pub content_type: Option<String>,
    /// Part headers, names in lowercase
    pub header: BTreeMap<String, String>,
    pub content: Bytes
}

impl FileHeader
{
    pub fn size(&self) -> usize
    {
        self.content.len()
    }
}

pub type Files = BTreeMap<String, Vec<FileHeader>>;

#[derive(Debug, Default)]
pub struct MultipartForm
{
    pub values: Values,
    pub files: Files
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize>
{
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Position of the next delimiter that closes a part. A match counts
/// only when followed by `--` or by optional padding and a line break;
/// anything else is part content.
fn find_delimiter(haystack: &[u8], delimiter: &[u8]) -> Option<usize>
{
    let mut from = 0;
    while let Some(pos) = find(&haystack[from..], delimiter) {
        let at = from + pos;
        let tail = &haystack[at + delimiter.len()..];
        let pad = tail.iter().take_while(|&&b| b == b' ' || b == b'\t').count();
        if tail.starts_with(b"--")
            || tail[pad..].starts_with(b"\r\n")
            || tail[pad..].starts_with(b"\n")
        {
            return Some(at);
        }
        from = at + 1;
    }
    None
}

/// Decode a complete `multipart/form-data` body.
///
/// The body is expected to be fully buffered; parts are sliced out of it
/// without copying.
pub fn parse_multipart(body: &Bytes, boundary: &str) -> Result<MultipartForm, Error>
{
    if boundary.is_empty() {
        return Err(Error::InvalidContent);
    }
    let dash_boundary = format!("--{}", boundary).into_bytes();
    let delimiter = format!("\r\n--{}", boundary).into_bytes();

    let start = find(body, &dash_boundary)
        .ok_or(Error::Multipart("missing boundary"))?;
    let mut rest = body.slice(start + dash_boundary.len()..);
    let mut form = MultipartForm::default();
    loop {
        if rest.starts_with(b"--") {
            return Ok(form);
        }
        // transport padding before the line break
        let pad = rest.iter().take_while(|&&b| b == b' ' || b == b'\t').count();
        let skip = if rest[pad..].starts_with(b"\r\n") {
            pad + 2
        } else if rest[pad..].starts_with(b"\n") {
            pad + 1
        } else {
            return Err(Error::Multipart("malformed delimiter"));
        };
        rest = rest.slice(skip..);

        let mut headers = [httparse::EMPTY_HEADER; MAX_PART_HEADERS];
        let (consumed, parsed) = match httparse::parse_headers(&rest, &mut headers)? {
            httparse::Status::Complete(res) => res,
            httparse::Status::Partial =>
                return Err(Error::Multipart("unterminated part header"))
        };
        let mut header = BTreeMap::new();
        for h in parsed {
            header.insert(h.name.to_ascii_lowercase(),
                          String::from_utf8_lossy(h.value).into_owned());
        }
        rest = rest.slice(consumed..);

        let end = find_delimiter(&rest, &delimiter)
            .ok_or(Error::Multipart("unterminated part"))?;
        let content = rest.slice(..end);
        rest = rest.slice(end + delimiter.len()..);

        let (name, filename) = match header.get("content-disposition") {
            Some(disposition) => parse_disposition(disposition),
            None => (None, None)
        };
        let name = match name {
            Some(name) if !name.is_empty() => name,
            _ => continue
        };
        match filename {
            Some(filename) if !filename.is_empty() => {
                let file = FileHeader{
                    filename: base_name(&filename).to_string(),
                    content_type: header.get("content-type").cloned(),
                    header,
                    content
                };
                form.files.entry(name).or_insert_with(Vec::new).push(file);
            },
            _ => {
                let value = String::from_utf8_lossy(&content).into_owned();
                form.values.entry(name).or_insert_with(Vec::new).push(value);
            }
        }
    }
}

/// Extract `name` and `filename` from a `form-data` disposition
fn parse_disposition(value: &str) -> (Option<String>, Option<String>)
{
    let mut params = value.split(';').map(str::trim);
    match params.next() {
        Some(kind) if kind.eq_ignore_ascii_case("form-data") => {},
        _ => return (None, None)
    }
    let mut name = None;
    let mut filename = None;
    for param in params {
        if let Some(eq) = param.find('=') {
            let key = param[..eq].trim();
            let val = unquote(param[eq + 1..].trim());
            if key.eq_ignore_ascii_case("name") {
                name = Some(val);
            } else if key.eq_ignore_ascii_case("filename") {
                filename = Some(val);
            }
        }
    }
    (name, filename)
}

fn unquote(s: &str) -> String
{
    if s.len() > 1 && s.starts_with('"') && s.ends_with('"') {
        s[1..s.len() - 1].replace("\\\"", "\"").replace("\\\\", "\\")
    } else {
        s.to_string()
    }
}

fn base_name(path: &str) -> &str
{
    path.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(path)
}

#[cfg(test)]
const SAMPLE: &[u8] = b"preamble\r\n\
--XyZ\r\n\
Content-Disposition: form-data; name=\"title\"\r\n\
\r\n\
Hello, world\r\n\
--XyZ\r\n\
Content-Disposition: form-data; name=\"tag\"\r\n\
\r\n\
a\r\n\
--XyZ\r\n\
content-disposition: form-data; name=\"tag\"\r\n\
\r\n\
b\r\n\
--XyZ\r\n\
Content-Disposition: form-data; name=\"upload\"; filename=\"C:\\\\tmp\\\\notes.txt\"\r\n\
Content-Type: text/plain\r\n\
\r\n\
line one\r\nline two\r\n\
--XyZ\r\n\
Content-Disposition: form-data; filename=\"nameless.bin\"\r\n\
\r\n\
ignored\r\n\
--XyZ--\r\n\
epilogue";

#[test]
fn test_parse_multipart()
{
    let body = Bytes::from_static(SAMPLE);
    let form = parse_multipart(&body, "XyZ").unwrap();
    assert_eq!(form.values["title"], vec!["Hello, world"]);
    assert_eq!(form.values["tag"], vec!["a", "b"]);
    assert_eq!(form.values.len(), 2);
    let files = &form.files["upload"];
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].filename, "notes.txt");
    assert_eq!(files[0].content_type.as_deref(), Some("text/plain"));
    assert_eq!(&files[0].content[..], b"line one\r\nline two");
    assert_eq!(files[0].size(), 18);
    assert_eq!(form.files.len(), 1);
}

#[test]
fn test_parse_multipart_errors()
{
    let body = Bytes::from_static(b"no delimiter here");
    assert!(matches!(parse_multipart(&body, "XyZ"),
                     Err(Error::Multipart(_))));
    let body = Bytes::from_static(b"--XyZ\r\n\
Content-Disposition: form-data; name=\"a\"\r\n\
\r\n\
never closed");
    assert!(matches!(parse_multipart(&body, "XyZ"),
                     Err(Error::Multipart(_))));
    let body = Bytes::from_static(b"--XyZ--\r\n");
    let form = parse_multipart(&body, "XyZ").unwrap();
    assert!(form.values.is_empty() && form.files.is_empty());
}

#[test]
fn test_boundary_prefix_in_content()
{
    let body = Bytes::from_static(b"--XyZ\r\n\
Content-Disposition: form-data; name=\"text\"\r\n\
\r\n\
line\r\n--XyZabc more\r\n\
--XyZ \r\n\
Content-Disposition: form-data; name=\"next\"\r\n\
\r\n\
2\r\n\
--XyZ--");
    let form = parse_multipart(&body, "XyZ").unwrap();
    assert_eq!(form.values["text"], vec!["line\r\n--XyZabc more"]);
    assert_eq!(form.values["next"], vec!["2"]);
}

#[test]
fn test_disposition()
{
    assert_eq!(parse_disposition("form-data; name=\"a\"; filename=\"b.txt\""),
               (Some("a".to_string()), Some("b.txt".to_string())));
    assert_eq!(parse_disposition("attachment; name=\"a\""), (None, None));
    assert_eq!(parse_disposition("form-data; name=plain"),
               (Some("plain".to_string()), None));
}
