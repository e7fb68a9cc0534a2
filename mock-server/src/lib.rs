use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::{HeaderMap, Method, StatusCode},
    routing::{any, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::RwLock};
use uuid::Uuid;

/// Headers reflected by `/echo`, besides any `x-*` header.
const ECHOED_HEADERS: &[&str] = &["accept", "authorization", "content-type", "user-agent"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Running,
    Done,
    Abandoned,
}

/// A server-side job that completes after `steps` status polls.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub state: JobState,
    pub polls: u32,
    pub steps: u32,
    pub result: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateJob {
    #[serde(default = "default_steps")]
    pub steps: u32,
}

fn default_steps() -> u32 {
    3
}

impl Default for CreateJob {
    fn default() -> Self {
        Self {
            steps: default_steps(),
        }
    }
}

pub type Db = Arc<RwLock<HashMap<Uuid, Job>>>;

pub fn app() -> Router {
    let db: Db = Arc::new(RwLock::new(HashMap::new()));
    Router::new()
        .route("/echo", any(echo))
        .route("/echo/{*rest}", any(echo))
        .route("/jobs", post(create_job))
        .route("/jobs/{id}", get(poll_job).delete(abandon_job))
        .with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

async fn echo(method: Method, RawQuery(query): RawQuery, headers: HeaderMap, body: Bytes) -> Json<Value> {
    let echoed: serde_json::Map<String, Value> = headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            name.starts_with("x-") || ECHOED_HEADERS.contains(&name)
        })
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
            )
        })
        .collect();
    tracing::debug!(%method, query = query.as_deref().unwrap_or(""), bytes = body.len(), "echo");
    Json(json!({
        "method": method.as_str(),
        "query": query,
        "headers": echoed,
        "body": String::from_utf8_lossy(&body),
    }))
}

async fn create_job(State(db): State<Db>, body: Bytes) -> Result<(StatusCode, Json<Job>), (StatusCode, String)> {
    let input = if body.is_empty() {
        CreateJob::default()
    } else {
        serde_json::from_slice::<CreateJob>(&body).map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?
    };
    let job = Job {
        id: Uuid::new_v4(),
        state: JobState::Running,
        polls: 0,
        steps: input.steps,
        result: None,
    };
    tracing::info!(id = %job.id, steps = job.steps, "job created");
    db.write().await.insert(job.id, job.clone());
    Ok((StatusCode::CREATED, Json(job)))
}

async fn poll_job(State(db): State<Db>, Path(id): Path<Uuid>) -> Result<Json<Job>, StatusCode> {
    let mut jobs = db.write().await;
    let job = jobs.get_mut(&id).ok_or(StatusCode::NOT_FOUND)?;
    if job.state == JobState::Running {
        job.polls += 1;
        if job.polls >= job.steps {
            job.state = JobState::Done;
            job.result = Some(format!("job {id} finished after {} polls", job.polls));
        }
    }
    tracing::debug!(%id, polls = job.polls, state = ?job.state, "job polled");
    Ok(Json(job.clone()))
}

async fn abandon_job(State(db): State<Db>, Path(id): Path<Uuid>) -> StatusCode {
    let mut jobs = db.write().await;
    match jobs.get_mut(&id) {
        Some(job) => {
            if job.state == JobState::Running {
                job.state = JobState::Abandoned;
            }
            tracing::info!(%id, "job abandoned");
            StatusCode::NO_CONTENT
        }
        None => StatusCode::NOT_FOUND,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_serializes_to_json() {
        let job = Job {
            id: Uuid::nil(),
            state: JobState::Running,
            polls: 1,
            steps: 3,
            result: None,
        };
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["id"], "00000000-0000-0000-0000-000000000000");
        assert_eq!(json["state"], "running");
        assert_eq!(json["polls"], 1);
        assert!(json["result"].is_null());
    }

    #[test]
    fn create_job_defaults_steps() {
        let input: CreateJob = serde_json::from_str("{}").unwrap();
        assert_eq!(input.steps, 3);
        assert_eq!(CreateJob::default().steps, 3);
    }

    #[test]
    fn create_job_rejects_negative_steps() {
        let result: Result<CreateJob, _> = serde_json::from_str(r#"{"steps":-1}"#);
        assert!(result.is_err());
    }
}
