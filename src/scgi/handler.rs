use super::request::Request;
use super::response::Response;

/// Application callback for requests routed to a path prefix.
///
/// Returning `None` makes the server answer with an internal error.
#[async_trait]
pub trait Handler: Send + Sync + 'static
{
    async fn handle(&self, req: &Request) -> Option<Response>;
}

/// Plain functions and closures are handlers
#[async_trait]
impl<F> Handler for F
    where F: Fn(&Request) -> Option<Response> + Send + Sync + 'static
{
    async fn handle(&self, req: &Request) -> Option<Response>
    {
        self(req)
    }
}
