//! HTTP file dispatcher.
//!
//! Maps a request path tail plus `_HLS_*` query directives onto the muxer's
//! files. The outer server owns routing and auth; [`HlsService`] is a
//! ready-made hyper adapter for embedders that want one.

use crate::error::Cancelled;
use crate::muxer::HlsMuxer;
use crate::playlist::{primary_playlist, BlockingPlaylistResponse};
use crate::segment::SegmentFinalized;
use bytes::Bytes;
use futures_util::stream;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use log::error;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const MP4_CONTENT_TYPE: &str = "video/mp4";

pub type FileBody = BoxBody<Bytes, Infallible>;
pub type FileResponse = Response<FileBody>;

/// Query directives of a playlist request.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FileQuery {
    pub msn: Option<String>,
    pub part: Option<String>,
    pub skip: Option<String>,
}

impl FileQuery {
    /// Pick the `_HLS_*` directives out of a raw query string.
    pub fn parse(query: &str) -> Self {
        let mut out = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "_HLS_msn" => out.msn = Some(value.into_owned()),
                "_HLS_part" => out.part = Some(value.into_owned()),
                "_HLS_skip" => out.skip = Some(value.into_owned()),
                _ => {}
            }
        }
        out
    }
}

fn status_response(status: StatusCode) -> anyhow::Result<FileResponse> {
    Ok(Response::builder().status(status).body(BoxBody::default())?)
}

fn full_response(content_type: &str, content: Bytes) -> anyhow::Result<FileResponse> {
    Ok(Response::builder()
        .header(CONTENT_TYPE, content_type)
        .body(Full::new(content).boxed())?)
}

fn segment_response(segment: &SegmentFinalized) -> anyhow::Result<FileResponse> {
    // Stream the finalized parts without concatenating them.
    let frames: Vec<Result<Frame<Bytes>, Infallible>> = segment
        .parts()
        .iter()
        .map(|part| Ok(Frame::data(part.content().clone())))
        .collect();
    let body = StreamBody::new(stream::iter(frames)).boxed();
    Ok(Response::builder()
        .header(CONTENT_TYPE, MP4_CONTENT_TYPE)
        .body(body)?)
}

pub(crate) async fn file_response(
    muxer: &HlsMuxer,
    name: &str,
    query: &FileQuery,
) -> anyhow::Result<FileResponse> {
    match name {
        "index.m3u8" => full_response(
            PLAYLIST_CONTENT_TYPE,
            primary_playlist(&muxer.stream_info()),
        ),
        "init.mp4" => match muxer.init_content().await {
            Ok(content) => full_response(MP4_CONTENT_TYPE, content),
            Err(e) => {
                error!("generate init: {e}");
                status_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        },
        "stream.m3u8" => stream_playlist(muxer, query).await,
        _ if name.starts_with("seg") => match muxer.playlist().segment(name).await {
            Ok(Some(segment)) => segment_response(&segment),
            Ok(None) => status_response(StatusCode::NOT_FOUND),
            Err(Cancelled) => status_response(StatusCode::INTERNAL_SERVER_ERROR),
        },
        _ if name.starts_with("part") => match muxer.playlist().blocking_part(name).await {
            Ok(Some(content)) => full_response(MP4_CONTENT_TYPE, content),
            Ok(None) => status_response(StatusCode::NOT_FOUND),
            Err(Cancelled) => status_response(StatusCode::INTERNAL_SERVER_ERROR),
        },
        _ => status_response(StatusCode::NOT_FOUND),
    }
}

async fn stream_playlist(muxer: &HlsMuxer, query: &FileQuery) -> anyhow::Result<FileResponse> {
    let is_delta_update = matches!(query.skip.as_deref(), Some("YES") | Some("v2"));

    let msn = match &query.msn {
        Some(msn) => match msn.parse::<u64>() {
            Ok(msn) => Some(msn),
            Err(_) => return status_response(StatusCode::BAD_REQUEST),
        },
        None => None,
    };
    let part = match &query.part {
        Some(part) => match part.parse::<u64>() {
            Ok(part) => Some(part),
            Err(_) => return status_response(StatusCode::BAD_REQUEST),
        },
        None => None,
    };

    match (msn, part) {
        (Some(msn), part) => {
            match muxer
                .playlist()
                .blocking_playlist(msn, part.unwrap_or(0), is_delta_update)
                .await
            {
                Ok(BlockingPlaylistResponse::Playlist(content)) => {
                    full_response(PLAYLIST_CONTENT_TYPE, content)
                }
                Ok(BlockingPlaylistResponse::BadRequest) => {
                    status_response(StatusCode::BAD_REQUEST)
                }
                Err(Cancelled) => status_response(StatusCode::INTERNAL_SERVER_ERROR),
            }
        }
        // A part directive without a sequence number is malformed.
        (None, Some(_)) => status_response(StatusCode::BAD_REQUEST),
        (None, None) => match muxer.playlist().playlist(is_delta_update).await {
            Ok(Some(content)) => full_response(PLAYLIST_CONTENT_TYPE, content),
            Ok(None) => status_response(StatusCode::NOT_FOUND),
            Err(Cancelled) => status_response(StatusCode::INTERNAL_SERVER_ERROR),
        },
    }
}

/// Hyper adapter for the file dispatcher.
#[derive(Clone)]
pub struct HlsService {
    muxer: Arc<HlsMuxer>,
}

impl HlsService {
    pub fn new(muxer: Arc<HlsMuxer>) -> Self {
        Self { muxer }
    }
}

impl Service<Request<Incoming>> for HlsService {
    type Response = FileResponse;
    type Error = anyhow::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let muxer = self.muxer.clone();
        Box::pin(async move {
            if req.method() != Method::GET {
                return status_response(StatusCode::NOT_FOUND);
            }

            let name = req
                .uri()
                .path()
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_owned();
            let query = FileQuery::parse(req.uri().query().unwrap_or_default());

            match file_response(&muxer, &name, &query).await {
                Ok(res) => Ok(res),
                Err(e) => {
                    error!("{}", e);
                    status_response(StatusCode::INTERNAL_SERVER_ERROR)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_query() {
        assert_eq!(FileQuery::default(), FileQuery::parse(""));
        assert_eq!(
            FileQuery {
                msn: Some("7".to_owned()),
                part: Some("2".to_owned()),
                skip: Some("YES".to_owned()),
            },
            FileQuery::parse("_HLS_msn=7&_HLS_part=2&_HLS_skip=YES")
        );
        assert_eq!(
            FileQuery {
                msn: Some("7".to_owned()),
                ..FileQuery::default()
            },
            FileQuery::parse("_HLS_msn=7&unrelated=1")
        );
    }
}
