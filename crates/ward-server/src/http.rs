//! 🏗 HTTP adapter: routes, JSON bodies and status codes

use std::io::Read;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tiny_http::{Header, Method, Response};
use tracing::warn;
use uuid::Uuid;
use ward_core::{
    AllocError, Command, HistoryFilter, NewSubject, PoolKind, Reply, Request, RequestContext,
    Responder, SubjectId, UnitId,
};

/// Actor used when a request carries no `X-Actor` header
const ANONYMOUS: &str = "anonymous";

const ROUTES: &str = "🦀 could not find the service you are looking for!

Valid requests are:
  POST /api/seed
  GET  /api/units?pool=&status=
  GET  /api/units/{id}
  GET  /api/pools/{pool}
  GET  /api/pools/{pool}/available
  GET  /api/pools/{pool}/occupancy
  GET  /api/ambulances
  POST /api/subjects
  GET  /api/subjects/pending?pool=
  GET  /api/subjects/{id}
  POST /api/allocate
  POST /api/release
  GET  /api/history?pool=&subject=";

#[derive(Deserialize)]
struct AllocateBody {
    subject: SubjectId,
    pool: PoolKind,
    #[serde(default)]
    unit: Option<UnitId>,
}

#[derive(Deserialize)]
struct ReleaseBody {
    unit: UnitId,
    #[serde(default)]
    reason: String,
}

struct HttpResponder(tiny_http::Request);

impl Responder for HttpResponder {
    fn respond(self: Box<Self>, result: Result<Reply, AllocError>, context: &RequestContext) {
        let res = match result {
            Ok(reply) => match serde_json::to_vec(&reply) {
                Ok(body) => Response::from_data(body).with_status_code(200u16),
                Err(err) => error_response(500, "internal", &err.to_string()),
            },
            Err(err) => error_response(status_of(&err), err.code(), &err.to_string()),
        };
        send(self.0, res, Some(context.request_id));
    }
}

/// HTTP status code for an allocation error
pub fn status_of(err: &AllocError) -> u16 {
    match err {
        AllocError::InvalidInput(_) => 400,
        AllocError::NotFound(_) => 404,
        AllocError::AlreadyAllocated(_)
        | AllocError::PoolExhausted(_)
        | AllocError::NotAllocated(_)
        | AllocError::Conflict(_) => 409,
        AllocError::StorageUnavailable(_) => 503,
    }
}

fn error_response(status: u16, code: &str, message: &str) -> Response<std::io::Cursor<Vec<u8>>> {
    let body = serde_json::json!({ "error": code, "message": message });
    Response::from_data(body.to_string().into_bytes()).with_status_code(status)
}

/// Parse the given HTTP request
///
/// If [`None`] is returned, the request was already answered with a
/// corresponding error message.
pub fn parse(mut rq: tiny_http::Request) -> Option<Request> {
    use tiny_http::Method::*;

    if *rq.method() == Options {
        send(rq, Response::empty(204), None);
        return None;
    }

    let context = context_of(&rq);
    let method = rq.method().clone();
    let url = rq.url().to_owned();
    let (path, query) = url.split_once('?').unwrap_or((url.as_str(), ""));
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    let command = match (method, segments.as_slice()) {
        (Post, ["api", "seed"]) => Ok(Command::SeedPools),
        (Get, ["api", "units"]) => list_units(query),
        (Get, ["api", "units", id]) => parse_param::<UnitId>("unit", id)
            .map(|unit| Command::UnitStatus { unit }),
        (Get, ["api", "pools", pool]) => parse_param::<PoolKind>("pool", pool)
            .map(|pool| Command::PoolSummary { pool }),
        (Get, ["api", "pools", pool, "available"]) => parse_param::<PoolKind>("pool", pool)
            .map(|pool| Command::AvailableCount { pool }),
        (Get, ["api", "pools", pool, "occupancy"]) => parse_param::<PoolKind>("pool", pool)
            .map(|pool| Command::OccupancyRate { pool }),
        (Get, ["api", "ambulances"]) => Ok(Command::AmbulanceBoard),
        (Post, ["api", "subjects"]) => read_json::<NewSubject>(&mut rq).map(Command::RegisterSubject),
        (Get, ["api", "subjects", "pending"]) => match query_param(query, "pool") {
            Some(pool) => parse_param::<PoolKind>("pool", pool)
                .map(|pool| Command::PendingSubjects { pool }),
            None => Err(AllocError::InvalidInput(String::from("missing query parameter `pool`"))),
        },
        (Get, ["api", "subjects", id]) => parse_param::<SubjectId>("subject", id)
            .map(|subject| Command::GetSubject { subject }),
        (Post, ["api", "allocate"]) => read_json::<AllocateBody>(&mut rq).map(|body| {
            Command::Allocate {
                subject: body.subject,
                pool: body.pool,
                unit: body.unit,
            }
        }),
        (Post, ["api", "release"]) => read_json::<ReleaseBody>(&mut rq).map(|body| {
            Command::Release {
                unit: body.unit,
                reason: body.reason,
            }
        }),
        (Get, ["api", "history"]) => history(query),
        (Get, _) | (Post, _) => {
            send(rq, Response::from_string(ROUTES).with_status_code(404u16), None);
            return None;
        }
        _ => {
            send(rq, Response::empty(405), None);
            return None;
        }
    };

    match command {
        Ok(command) => Some(Request::new(command, context, Box::new(HttpResponder(rq)))),
        Err(err) => {
            let res = error_response(status_of(&err), err.code(), &err.to_string());
            send(rq, res, Some(context.request_id));
            None
        }
    }
}

fn context_of(rq: &tiny_http::Request) -> RequestContext {
    let mut actor = None;
    let mut request_id = None;
    for hdr in rq.headers() {
        if hdr.field.equiv("x-actor") {
            let value = hdr.value.as_str().trim();
            if !value.is_empty() {
                actor = Some(value.to_owned());
            }
        } else if hdr.field.equiv("x-request-id") {
            if let Ok(id) = Uuid::parse_str(hdr.value.as_str()) {
                request_id = Some(id);
            }
        }
    }

    let mut context = RequestContext::new(actor.unwrap_or_else(|| String::from(ANONYMOUS)));
    if let Some(id) = request_id {
        context.request_id = id;
    }
    context
}

fn list_units(query: &str) -> Result<Command, AllocError> {
    Ok(Command::ListUnits {
        pool: optional_param(query, "pool")?,
        status: optional_param(query, "status")?,
    })
}

fn history(query: &str) -> Result<Command, AllocError> {
    Ok(Command::History {
        filter: HistoryFilter {
            pool: optional_param(query, "pool")?,
            subject: optional_param(query, "subject")?,
        },
    })
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, v)| *k == key && !v.is_empty())
        .map(|(_, v)| v)
}

fn optional_param<T>(query: &str, key: &str) -> Result<Option<T>, AllocError>
where
    T: FromStr,
{
    query_param(query, key)
        .map(|v| parse_param(key, v))
        .transpose()
}

fn parse_param<T: FromStr>(name: &str, value: &str) -> Result<T, AllocError> {
    value
        .parse()
        .map_err(|_| AllocError::InvalidInput(format!("invalid {name} `{value}`")))
}

fn read_json<T: DeserializeOwned>(rq: &mut tiny_http::Request) -> Result<T, AllocError> {
    let mut body = Vec::with_capacity(rq.body_length().unwrap_or(0));
    rq.as_reader()
        .read_to_end(&mut body)
        .map_err(|err| AllocError::InvalidInput(format!("could not read body: {err}")))?;
    serde_json::from_slice(&body)
        .map_err(|err| AllocError::InvalidInput(format!("malformed JSON body: {err}")))
}

/// Add CORS and content headers to `res` and send it
fn send<R: Read>(rq: tiny_http::Request, mut res: Response<R>, request_id: Option<Uuid>) {
    let json = *rq.method() != Method::Options;
    for (field, value) in [
        ("Access-Control-Request-Method", "*"),
        ("Access-Control-Allow-Origin", "*"),
        ("Access-Control-Allow-Headers", "*"),
        ("Access-Control-Expose-Headers", "*"),
    ] {
        add_header(&mut res, field, value);
    }
    if json {
        add_header(&mut res, "Content-Type", "application/json");
    }
    if let Some(id) = request_id {
        add_header(&mut res, "X-Request-Id", &id.hyphenated().to_string());
    }

    if let Err(err) = rq.respond(res) {
        warn!(%err, "HTTP response failed");
    }
}

fn add_header<R: Read>(res: &mut Response<R>, field: &str, value: &str) {
    if let Ok(header) = Header::from_bytes(field.as_bytes(), value.as_bytes()) {
        res.add_header(header);
    }
}
