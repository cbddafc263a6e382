//! Shared body type for every response the pipeline can produce: a static
//! string, a streamed proxy body, or a streamed file. One boxed type keeps
//! predicate signatures uniform (spec 4.1: "exactly one terminal action").

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type ResponseBody = BoxBody<Bytes, BoxError>;

pub fn empty() -> ResponseBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn full<T: Into<Bytes>>(data: T) -> ResponseBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn text(s: impl Into<String>) -> ResponseBody {
    full(s.into().into_bytes())
}
