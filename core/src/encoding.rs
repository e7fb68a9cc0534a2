//! Wire encoding of resolved requests.
//!
//! Transports that speak plain HTTP call `ResolvedRequest::to_http_request`
//! to get a URL, headers and body they can send as-is.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use url::form_urlencoded;
use uuid::Uuid;

use crate::error::ApiError;
use crate::http::{Headers, HttpRequest};
use crate::params::{MultipartItem, Parameters};
use crate::resolve::ResolvedRequest;

const CONTENT_TYPE: &str = "Content-Type";

impl ResolvedRequest {
    /// Encode parameters into the URL or the body, depending on the method
    /// and the parameter variant.
    ///
    /// Url-encoded parameters go into the query for GET, HEAD and DELETE and
    /// into a form body otherwise; null values are left out. JSON parameters
    /// become a JSON body and multipart items a `multipart/form-data` body.
    /// A `Content-Type` header already present is kept as is.
    pub fn to_http_request(&self) -> Result<HttpRequest, ApiError> {
        let mut url = self.url.clone();
        let mut headers = self.headers.clone();
        let body = match &self.parameters {
            Parameters::UrlEncoded(map) if self.method.encodes_parameters_in_url() => {
                if map.values().any(Option::is_some) {
                    let mut query = url.query_pairs_mut();
                    for (key, value) in map {
                        if let Some(value) = value {
                            query.append_pair(key, value);
                        }
                    }
                }
                None
            }
            Parameters::UrlEncoded(map) => {
                if map.is_empty() {
                    None
                } else {
                    set_content_type(&mut headers, "application/x-www-form-urlencoded; charset=utf-8");
                    Some(form_urlencode(map).into_bytes())
                }
            }
            Parameters::Json(object) => {
                let body = serde_json::to_vec(object).map_err(|e| ApiError::Encoding(e.to_string()))?;
                set_content_type(&mut headers, "application/json");
                Some(body)
            }
            Parameters::Multipart(items) if items.is_empty() => None,
            Parameters::Multipart(items) => {
                let boundary = format!("courier-boundary-{}", Uuid::new_v4().simple());
                let body = encode_multipart(items, &boundary)?;
                set_content_type(&mut headers, &format!("multipart/form-data; boundary={boundary}"));
                Some(body)
            }
        };
        Ok(HttpRequest {
            method: self.method,
            url,
            headers,
            body,
            timeout: self.timeout,
        })
    }
}

fn set_content_type(headers: &mut Headers, value: &str) {
    if !headers.contains(CONTENT_TYPE) {
        headers.add(CONTENT_TYPE, value);
    }
}

/// `application/x-www-form-urlencoded` text for `map`, keys in order, nulls
/// dropped.
pub fn form_urlencode(map: &BTreeMap<String, Option<String>>) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in map {
        if let Some(value) = value {
            serializer.append_pair(key, value);
        }
    }
    serializer.finish()
}

/// `multipart/form-data` body for `items` using `boundary`. File items are
/// read from disk here.
pub fn encode_multipart(items: &[MultipartItem], boundary: &str) -> Result<Vec<u8>, ApiError> {
    let mut body = Vec::new();
    for item in items {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        match item {
            MultipartItem::Data { name, value } => {
                part_header(&mut body, name, None);
                body.extend_from_slice(value);
            }
            MultipartItem::FileData {
                name,
                data,
                file_name,
                mime_type,
            } => {
                part_header(&mut body, name, Some((file_name, mime_type)));
                body.extend_from_slice(data);
            }
            MultipartItem::File {
                name,
                path,
                file_name,
                mime_type,
            } => {
                let data = std::fs::read(path).map_err(|e| file_error(path, e))?;
                part_header(&mut body, name, Some((file_name, mime_type)));
                body.extend_from_slice(&data);
            }
            MultipartItem::PartialFile {
                name,
                path,
                offset,
                length,
                file_name,
                mime_type,
            } => {
                let data = read_range(path, *offset, *length)?;
                part_header(&mut body, name, Some((file_name, mime_type)));
                body.extend_from_slice(&data);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    Ok(body)
}

fn part_header(body: &mut Vec<u8>, name: &str, file: Option<(&String, &String)>) {
    let name = escape_quoted(name);
    match file {
        Some((file_name, mime_type)) => {
            let file_name = escape_quoted(file_name);
            body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\n\
                     Content-Type: {mime_type}\r\n\r\n"
                )
                .as_bytes(),
            );
        }
        None => {
            body.extend_from_slice(format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes());
        }
    }
}

fn escape_quoted(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"").replace(['\r', '\n'], " ")
}

fn read_range(path: &Path, offset: u64, length: u64) -> Result<Vec<u8>, ApiError> {
    let mut file = File::open(path).map_err(|e| file_error(path, e))?;
    file.seek(SeekFrom::Start(offset)).map_err(|e| file_error(path, e))?;
    let mut data = Vec::new();
    file.take(length)
        .read_to_end(&mut data)
        .map_err(|e| file_error(path, e))?;
    if (data.len() as u64) < length {
        return Err(ApiError::Encoding(format!(
            "{}: wanted {length} bytes at offset {offset}, file has only {}",
            path.display(),
            data.len()
        )));
    }
    Ok(data)
}

fn file_error(path: &Path, error: std::io::Error) -> ApiError {
    ApiError::Encoding(format!("{}: {error}", path.display()))
}
