use std::fmt;

/// A cookie received in `HTTP_COOKIE`, or one to send back with a
/// response. Only `name` and `value` are filled in for received cookies.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Cookie
{
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub max_age: Option<i64>,
    pub secure: bool,
    pub http_only: bool
}

impl Cookie
{
    pub fn new<N, V>(name: N, value: V) -> Cookie
        where N: Into<String>, V: Into<String>
    {
        Cookie{name: name.into(), value: value.into(), ..Cookie::default()}
    }

    pub fn with_path(mut self, path: &str) -> Cookie
    {
        self.path = Some(path.to_string());
        self
    }

    pub fn with_domain(mut self, domain: &str) -> Cookie
    {
        self.domain = Some(domain.to_string());
        self
    }

    pub fn with_max_age(mut self, seconds: i64) -> Cookie
    {
        self.max_age = Some(seconds);
        self
    }

    pub fn secure(mut self) -> Cookie
    {
        self.secure = true;
        self
    }

    pub fn http_only(mut self) -> Cookie
    {
        self.http_only = true;
        self
    }
}

/// Renders the value of a `Set-Cookie` header line
impl fmt::Display for Cookie
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        if self.value.contains(|c: char| c == ' ' || c == ',') {
            write!(f, "{}=\"{}\"", self.name, self.value)?;
        } else {
            write!(f, "{}={}", self.name, self.value)?;
        }
        if let Some(path) = &self.path {
            write!(f, "; Path={}", path)?;
        }
        if let Some(domain) = &self.domain {
            write!(f, "; Domain={}", domain.trim_start_matches('.'))?;
        }
        match self.max_age {
            Some(age) if age > 0 => write!(f, "; Max-Age={}", age)?,
            Some(_) => f.write_str("; Max-Age=0")?,
            None => {}
        }
        if self.http_only {
            f.write_str("; HttpOnly")?;
        }
        if self.secure {
            f.write_str("; Secure")?;
        }
        Ok(())
    }
}

/// Split an `HTTP_COOKIE` value into cookies, keeping their order.
pub fn parse_cookies(header: &str) -> Vec<Cookie>
{
    header.split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| match part.find('=') {
            Some(eq) if eq > 0 =>
                Cookie::new(&part[..eq], unquote(&part[eq + 1..])),
            _ => Cookie::new(part, "")
        })
        .collect()
}

fn unquote(s: &str) -> &str
{
    if s.len() > 1 && s.starts_with('"') && s.ends_with('"') {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

#[test]
fn test_parse_cookies()
{
    let cookies = parse_cookies(" sid=abc123; theme=\"dark blue\";;flag; =odd ;x=a=b");
    let pairs: Vec<(&str, &str)> = cookies.iter()
        .map(|c| (c.name.as_str(), c.value.as_str()))
        .collect();
    assert_eq!(pairs, vec![("sid", "abc123"),
                           ("theme", "dark blue"),
                           ("flag", ""),
                           ("=odd", ""),
                           ("x", "a=b")]);
    assert!(parse_cookies("").is_empty());
    assert_eq!(parse_cookies("q=\"")[0].value, "\"");
}

#[test]
fn test_set_cookie_string()
{
    assert_eq!(Cookie::new("sid", "abc").to_string(), "sid=abc");
    let c = Cookie::new("sid", "a b")
        .with_path("/")
        .with_domain(".example.com")
        .with_max_age(3600)
        .http_only()
        .secure();
    assert_eq!(c.to_string(),
               "sid=\"a b\"; Path=/; Domain=example.com; Max-Age=3600; HttpOnly; Secure");
    assert_eq!(Cookie::new("gone", "").with_max_age(-1).to_string(),
               "gone=; Max-Age=0");
}
