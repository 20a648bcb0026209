use bytes::Bytes;
use percent_encoding::percent_decode_str;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::Unpin;
use std::str::FromStr;
use tokio::io::AsyncRead;
use url::form_urlencoded;

use super::connection::Connection;
use super::cookie::{self, Cookie};
use super::defs;
use super::error::Error;
use super::header::{self, Header};
use super::multipart::{self, Files};
use super::settings::Settings;

/// Multi-valued mapping decoded from a query string or form
pub type Values = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method
{
    Get,
    Post,
    Put,
    Delete
}

impl FromStr for Method
{
    type Err = Error;

    fn from_str(s: &str) -> Result<Method, Error>
    {
        match s {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            _ => Err(Error::InvalidHeader)
        }
    }
}

impl fmt::Display for Method
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE"
        })
    }
}

/// Path and query of the request URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestUri
{
    /// Percent decoded path
    pub path: String,
    /// Query string as sent, without the `?`
    pub raw_query: String
}

impl FromStr for RequestUri
{
    type Err = Error;

    /// Accepts origin form (`/path?query`) and absolute form
    /// (`scheme://host/path?query`).
    fn from_str(raw: &str) -> Result<RequestUri, Error>
    {
        if raw.starts_with('/') {
            let (path, query) = match raw.find('?') {
                Some(q) => (&raw[..q], &raw[q + 1..]),
                None => (raw, "")
            };
            Ok(RequestUri{path: decode_path(path)?,
                          raw_query: query.to_string()})
        } else {
            let url = url::Url::parse(raw)?;
            if url.cannot_be_a_base() {
                return Err(Error::InvalidUri(raw.to_string()));
            }
            Ok(RequestUri{path: decode_path(url.path())?,
                          raw_query: url.query().unwrap_or("").to_string()})
        }
    }
}

fn decode_path(path: &str) -> Result<String, Error>
{
    percent_decode_str(path).decode_utf8()
        .map(|p| p.into_owned())
        .map_err(|_| Error::InvalidUri(path.to_string()))
}

/// Decode a query string or urlencoded form into `Values`. A `%` not
/// followed by two hex digits is rejected.
pub fn parse_query(query: &[u8]) -> Result<Values, Error>
{
    let mut rest = query;
    while let Some(pct) = rest.iter().position(|&b| b == b'%') {
        match rest.get(pct + 1..pct + 3) {
            Some(hex) if hex.iter().all(u8::is_ascii_hexdigit) => {},
            _ => return Err(Error::InvalidQuery)
        }
        rest = &rest[pct + 3..];
    }
    let mut values = Values::new();
    for (k, v) in form_urlencoded::parse(query) {
        values.entry(k.into_owned()).or_insert_with(Vec::new).push(v.into_owned());
    }
    Ok(values)
}

/// One decoded SCGI request
#[derive(Debug, Clone)]
pub struct Request
{
    pub header: Header,
    pub method: Method,
    pub raw_uri: String,
    pub url: RequestUri,
    pub query: Values,
    pub form: Values,
    pub files: Files,
    pub cookies: Vec<Cookie>,
    pub is_ajax: bool,
    /// Set when the front end forwarded a WebSocket upgrade request.
    /// The upgrade itself is not performed.
    pub is_websocket: bool,
    pub user_agent: String,
    /// Media type of the body, without parameters
    pub content_type: String,
    pub content_size: usize,
    pub content: Bytes
}

impl Request
{
    /// Build a request from a decoded header, reading the body from
    /// `conn` when one is declared.
    pub async fn decode<S>(header: Header, conn: &mut Connection<S>,
                           settings: &Settings) -> Result<Request, Error>
        where S: AsyncRead + Unpin
    {
        let content_size = match header.get(defs::CONTENT_LENGTH) {
            Some(len) if !len.is_empty() =>
                len.parse::<usize>().map_err(|_| Error::InvalidContent)?,
            _ => 0
        };
        if content_size > settings.max_content_size {
            return Err(Error::InvalidContent);
        }

        let mut content_type = String::new();
        let mut content = Bytes::new();
        let mut form = Values::new();
        let mut files = Files::new();
        if content_size > 0 {
            let media: mime::Mime = match header.get(defs::CONTENT_TYPE) {
                Some(ct) if !ct.is_empty() => ct.parse()?,
                _ => return Err(Error::InvalidHeader)
            };
            content_type = media.essence_str().to_string();
            if media.type_() == mime::APPLICATION
                && media.subtype() == mime::WWW_FORM_URLENCODED
            {
                content = conn.read_exact_bytes(content_size).await?;
                form = parse_query(&content)?;
            } else if media.type_() == mime::MULTIPART
                && media.subtype() == mime::FORM_DATA
            {
                let boundary = match media.get_param(mime::BOUNDARY) {
                    Some(b) => b.as_str().to_string(),
                    None => return Err(Error::InvalidContent)
                };
                // Buffer the whole body first; parsing straight off the
                // socket would stall on the per read deadline.
                content = conn.read_exact_bytes(content_size).await?;
                let parsed = multipart::parse_multipart(&content, &boundary)?;
                form = parsed.values;
                files = parsed.files;
            } else {
                content = conn.read_exact_bytes(content_size).await?;
            }
        }

        let method = match header.get(defs::REQUEST_METHOD) {
            Some(m) => m.parse::<Method>()?,
            None => return Err(Error::InvalidHeader)
        };

        let raw_uri = match header.get(defs::REQUEST_URI) {
            Some(uri) if !uri.is_empty() => uri.clone(),
            _ => return Err(Error::InvalidHeader)
        };
        let url: RequestUri = raw_uri.parse()?;
        let query = parse_query(url.raw_query.as_bytes())?;

        let cookies = match header.get(defs::HTTP_COOKIE) {
            Some(c) => cookie::parse_cookies(c),
            None => Vec::new()
        };
        let is_ajax = header.get(defs::HTTP_X_REQUESTED_WITH)
            .map_or(false, |v| v == defs::XML_HTTP_REQUEST);
        let is_websocket = header.get(defs::HTTP_UPGRADE)
            .map_or(false, |v| v.eq_ignore_ascii_case("websocket"));
        let user_agent = header.get(defs::HTTP_USER_AGENT)
            .cloned().unwrap_or_default();

        Ok(Request{header, method, raw_uri, url, query, form, files, cookies,
                   is_ajax, is_websocket, user_agent,
                   content_type, content_size, content})
    }

    /// Any header value, e.g. `REMOTE_ADDR`
    pub fn param(&self, name: &str) -> Option<&str>
    {
        self.header.get(name).map(String::as_str)
    }

    pub fn path(&self) -> &str
    {
        &self.url.path
    }

    /// First query value for `name`
    pub fn query_value(&self, name: &str) -> Option<&str>
    {
        self.query.get(name).and_then(|v| v.first()).map(String::as_str)
    }

    /// First form value for `name`
    pub fn form_value(&self, name: &str) -> Option<&str>
    {
        self.form.get(name).and_then(|v| v.first()).map(String::as_str)
    }

    pub fn cookie(&self, name: &str) -> Option<&Cookie>
    {
        self.cookies.iter().find(|c| c.name == name)
    }
}

/// Read the header block and then the rest of the request
pub async fn read_request<S>(conn: &mut Connection<S>, settings: &Settings)
                             -> Result<Request, Error>
    where S: AsyncRead + Unpin
{
    let header = header::read_header(conn, settings).await?;
    Request::decode(header, conn, settings).await
}

#[cfg(test)]
use tokio::runtime::Runtime;
#[cfg(test)]
use tokio::io::AsyncReadExt;
#[cfg(test)]
use super::header::encode_header;

#[cfg(test)]
fn decode_bytes(input: &[u8], settings: &Settings) -> Result<Request, Error>
{
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let mut conn = Connection::new(input, settings);
        read_request(&mut conn, settings).await
    })
}

#[cfg(test)]
fn with_body(pairs: &[(&str, &str)], body: &[u8]) -> Vec<u8>
{
    [&encode_header(pairs)[..], body].concat()
}

#[test]
fn test_get_request()
{
    let input = with_body(&[("CONTENT_LENGTH", "0"),
                            ("REQUEST_METHOD", "GET"),
                            ("REQUEST_URI", "/cgi/test?x=1")], b"");
    let req = decode_bytes(&input, &Settings::new()).unwrap();
    assert_eq!(req.method, Method::Get);
    assert_eq!(req.url.path, "/cgi/test");
    assert_eq!(req.query["x"], vec!["1"]);
    assert!(req.content.is_empty());
    assert_eq!(req.content_size, 0);
    assert!(!req.is_ajax);
    assert!(req.cookies.is_empty());
}

#[test]
fn test_raw_body_fragmented()
{
    let head = encode_header(&[("CONTENT_LENGTH", "22"),
                               ("CONTENT_TYPE", "text/plain; charset=utf-8"),
                               ("REQUEST_METHOD", "PUT"),
                               ("REQUEST_URI", "/doc/a%20b")]);
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let input = (&head[..])
            .chain(&b"this is "[..])
            .chain(&b"a te"[..])
            .chain(&b"st request"[..]);
        let settings = Settings::new();
        let mut conn = Connection::new(input, &settings);
        let req = read_request(&mut conn, &settings).await.unwrap();
        assert_eq!(req.method, Method::Put);
        assert_eq!(req.path(), "/doc/a b");
        assert_eq!(req.content_type, "text/plain");
        assert_eq!(&req.content[..], b"this is a test request");
        assert_eq!(req.content.len(), req.content_size);
    });
}

#[test]
fn test_form_post()
{
    let body = b"name=J%C3%B6rn&tag=a&tag=b+c";
    let len = body.len().to_string();
    let input = with_body(&[("CONTENT_LENGTH", len.as_str()),
                            ("CONTENT_TYPE", "application/x-www-form-urlencoded"),
                            ("REQUEST_METHOD", "POST"),
                            ("REQUEST_URI", "/form?tag=q"),
                            ("HTTP_X_REQUESTED_WITH", "XMLHttpRequest"),
                            ("HTTP_USER_AGENT", "test-agent/1.0"),
                            ("HTTP_COOKIE", "sid=\"42\"; lang=en")], body);
    let req = decode_bytes(&input, &Settings::new()).unwrap();
    assert_eq!(req.method, Method::Post);
    assert_eq!(req.form_value("name"), Some("Jörn"));
    assert_eq!(req.form["tag"], vec!["a", "b c"]);
    assert_eq!(req.query_value("tag"), Some("q"));
    assert_eq!(&req.content[..], &body[..]);
    assert!(req.is_ajax);
    assert_eq!(req.user_agent, "test-agent/1.0");
    assert_eq!(req.cookie("sid").map(|c| c.value.as_str()), Some("42"));
    assert_eq!(req.cookies[1].name, "lang");
    assert_eq!(req.param("REQUEST_URI"), Some("/form?tag=q"));
}

#[test]
fn test_multipart_post()
{
    let body = b"--b0\r\n\
Content-Disposition: form-data; name=\"note\"\r\n\
\r\n\
hi\r\n\
--b0\r\n\
Content-Disposition: form-data; name=\"file\"; filename=\"a.txt\"\r\n\
\r\n\
AAA\r\n\
--b0--\r\n";
    let len = body.len().to_string();
    let input = with_body(&[("CONTENT_LENGTH", len.as_str()),
                            ("CONTENT_TYPE", "multipart/form-data; boundary=b0"),
                            ("REQUEST_METHOD", "POST"),
                            ("REQUEST_URI", "/upload")], body);
    let req = decode_bytes(&input, &Settings::new()).unwrap();
    assert_eq!(req.content_type, "multipart/form-data");
    assert_eq!(req.form_value("note"), Some("hi"));
    assert_eq!(req.files["file"][0].filename, "a.txt");
    assert_eq!(&req.files["file"][0].content[..], b"AAA");
    assert_eq!(req.content.len(), body.len());

    let input = with_body(&[("CONTENT_LENGTH", len.as_str()),
                            ("CONTENT_TYPE", "multipart/form-data"),
                            ("REQUEST_METHOD", "POST"),
                            ("REQUEST_URI", "/upload")], body);
    assert!(matches!(decode_bytes(&input, &Settings::new()),
                     Err(Error::InvalidContent)));
}

#[test]
fn test_content_limit_checked_before_body()
{
    let settings = Settings{max_content_size: 10, ..Settings::new()};
    // the body is absent; the size check must fail first
    let input = with_body(&[("CONTENT_LENGTH", "11"),
                            ("CONTENT_TYPE", "text/plain"),
                            ("REQUEST_METHOD", "POST"),
                            ("REQUEST_URI", "/")], b"");
    assert!(matches!(decode_bytes(&input, &settings),
                     Err(Error::InvalidContent)));
    let input = with_body(&[("CONTENT_LENGTH", "ten"),
                            ("REQUEST_METHOD", "POST"),
                            ("REQUEST_URI", "/")], b"");
    assert!(matches!(decode_bytes(&input, &settings),
                     Err(Error::InvalidContent)));
}

#[test]
fn test_header_errors()
{
    let settings = Settings::new();
    // body without a content type
    let input = with_body(&[("CONTENT_LENGTH", "2"),
                            ("REQUEST_METHOD", "POST"),
                            ("REQUEST_URI", "/")], b"ab");
    assert!(matches!(decode_bytes(&input, &settings), Err(Error::InvalidHeader)));
    let input = with_body(&[("REQUEST_METHOD", "PATCH"),
                            ("REQUEST_URI", "/")], b"");
    assert!(matches!(decode_bytes(&input, &settings), Err(Error::InvalidHeader)));
    let input = with_body(&[("REQUEST_URI", "/")], b"");
    assert!(matches!(decode_bytes(&input, &settings), Err(Error::InvalidHeader)));
    let input = with_body(&[("REQUEST_METHOD", "GET")], b"");
    assert!(matches!(decode_bytes(&input, &settings), Err(Error::InvalidHeader)));
    let input = with_body(&[("REQUEST_METHOD", "GET"),
                            ("REQUEST_URI", "relative/path")], b"");
    assert!(matches!(decode_bytes(&input, &settings), Err(Error::InvalidUri(_))));
    let input = with_body(&[("CONTENT_LENGTH", "2"),
                            ("CONTENT_TYPE", "not a type"),
                            ("REQUEST_METHOD", "POST"),
                            ("REQUEST_URI", "/")], b"ab");
    assert!(matches!(decode_bytes(&input, &settings), Err(Error::MediaType(_))));
}

#[test]
fn test_short_body()
{
    let input = with_body(&[("CONTENT_LENGTH", "10"),
                            ("CONTENT_TYPE", "text/plain"),
                            ("REQUEST_METHOD", "POST"),
                            ("REQUEST_URI", "/")], b"short");
    assert!(matches!(decode_bytes(&input, &Settings::new()),
                     Err(Error::UnexpectedEnd)));
}

#[test]
fn test_request_uri_forms()
{
    let uri: RequestUri = "http://example.com/a%2Fb/c?x=1&y".parse().unwrap();
    assert_eq!(uri.path, "/a/b/c");
    assert_eq!(uri.raw_query, "x=1&y");
    let uri: RequestUri = "/only/path".parse().unwrap();
    assert_eq!(uri.raw_query, "");
    assert!("mailto:someone@example.com".parse::<RequestUri>().is_err());
    let q = parse_query(b"y&x=1&x=2").unwrap();
    assert_eq!(q["x"], vec!["1", "2"]);
    assert_eq!(q["y"], vec![""]);
}

#[test]
fn test_bad_escapes_rejected()
{
    assert!(matches!(parse_query(b"a=%zz"), Err(Error::InvalidQuery)));
    assert!(matches!(parse_query(b"a=1%"), Err(Error::InvalidQuery)));
    assert_eq!(parse_query(b"a=%41%2b").unwrap()["a"], vec!["A+"]);

    let input = with_body(&[("REQUEST_METHOD", "GET"),
                            ("REQUEST_URI", "/x?q=%g1")], b"");
    assert!(matches!(decode_bytes(&input, &Settings::new()),
                     Err(Error::InvalidQuery)));
    let input = with_body(&[("CONTENT_LENGTH", "4"),
                            ("CONTENT_TYPE", "application/x-www-form-urlencoded"),
                            ("REQUEST_METHOD", "POST"),
                            ("REQUEST_URI", "/x")], b"a=%4");
    assert!(matches!(decode_bytes(&input, &Settings::new()),
                     Err(Error::InvalidQuery)));
}

#[test]
fn test_websocket_upgrade_flag()
{
    let input = with_body(&[("REQUEST_METHOD", "GET"),
                            ("REQUEST_URI", "/ws"),
                            ("HTTP_UPGRADE", "WebSocket")], b"");
    let req = decode_bytes(&input, &Settings::new()).unwrap();
    assert!(req.is_websocket);
    assert_eq!(Method::Delete.to_string(), "DELETE");
}
