
/// Number of bytes read per attempt while looking for the length
/// prefix of the header block.
pub const SCGI_LENGTH_CHUNK: usize = 8;

/// Terminator of the header netstring
pub const SCGI_HEADER_END: u8 = b',';

/// Header keys consumed by the request decoder
pub const CONTENT_LENGTH: &str = "CONTENT_LENGTH";
pub const CONTENT_TYPE: &str = "CONTENT_TYPE";
pub const REQUEST_METHOD: &str = "REQUEST_METHOD";
pub const REQUEST_URI: &str = "REQUEST_URI";
pub const HTTP_COOKIE: &str = "HTTP_COOKIE";
pub const HTTP_X_REQUESTED_WITH: &str = "HTTP_X_REQUESTED_WITH";
pub const HTTP_USER_AGENT: &str = "HTTP_USER_AGENT";
pub const HTTP_UPGRADE: &str = "HTTP_UPGRADE";

/// Other CGI variables commonly sent by front-end servers
pub const DOCUMENT_URI: &str = "DOCUMENT_URI";
pub const DOCUMENT_ROOT: &str = "DOCUMENT_ROOT";
pub const QUERY_STRING: &str = "QUERY_STRING";
pub const REMOTE_ADDR: &str = "REMOTE_ADDR";
pub const REMOTE_PORT: &str = "REMOTE_PORT";

/// Value of HTTP_X_REQUESTED_WITH marking an AJAX call
pub const XML_HTTP_REQUEST: &str = "XMLHttpRequest";

/// Response content types
pub const RESP_TYPE_HTML: &str = "text/html";
pub const RESP_TYPE_TEXT: &str = "text/plain";
pub const RESP_TYPE_JSON: &str = "text/json";

/// Response status lines
pub const RESP_CODE_OK: &str = "200 OK";
pub const RESP_CODE_BAD_REQUEST: &str = "400 Bad request";
pub const RESP_CODE_NOT_FOUND: &str = "404 Not found";
pub const RESP_CODE_INTERNAL_ERROR: &str = "500 Internal error";
