use super::http::{endpoint, GcpClient};
use crate::error::{Result, SetupError};
use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Where operation status is read from.
#[async_trait]
pub(crate) trait OperationSource: Send + Sync {
    /// `Ok(None)` when the operation is unknown.
    async fn poll(&self, url: Url) -> Result<Option<Value>>;
}

#[async_trait]
impl OperationSource for GcpClient {
    async fn poll(&self, url: Url) -> Result<Option<Value>> {
        self.fetch(url).await
    }
}

/// Polling schedule for long-running operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationPolicy {
    pub period: Duration,
    pub timeout: Duration,
}

impl Default for OperationPolicy {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(5),
            timeout: Duration::from_secs(60),
        }
    }
}

/// What an operation payload says about its progress.
#[derive(Debug, PartialEq)]
pub(crate) enum Progress {
    Running(String),
    Done(Value),
}

/// Reads an operation message. A finished operation yields its `response`
/// (empty when it has none); an `error` entry fails.
pub(crate) fn progress(operation: &Value) -> Result<Progress> {
    let done = operation.get("done").and_then(Value::as_bool).unwrap_or(false);
    if done {
        if let Some(error) = operation.get("error") {
            let code = error.get("code").and_then(Value::as_u64).unwrap_or(0);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            // google.rpc.Code ALREADY_EXISTS
            if code == 6 {
                let resource = operation.get("name").and_then(Value::as_str).unwrap_or("operation");
                return Err(SetupError::AlreadyExists { resource: format!("{} ({})", resource, message) });
            }
            return Err(SetupError::Api {
                status: u16::try_from(code).unwrap_or(0),
                message: format!("operation ended in error: {}", message),
            });
        }
        return Ok(Progress::Done(operation.get("response").cloned().unwrap_or_else(|| Value::Object(Default::default()))));
    }
    let is_operation = operation.get("done").is_some();
    match operation.get("name").and_then(Value::as_str) {
        Some(name) if is_operation || name.starts_with("operations/") || name.contains("/operations/") => {
            Ok(Progress::Running(name.to_string()))
        }
        // A synchronous answer carrying the resource itself.
        Some(_) => Ok(Progress::Done(operation.clone())),
        None if !is_operation => Ok(Progress::Done(operation.clone())),
        None => Err(SetupError::Transport(
            "the operation response contained neither a name nor a status".to_string(),
        )),
    }
}

/// Waits for `operation` to finish, polling `base/<operation name>`.
pub(crate) async fn wait<S>(source: &S, base: &str, operation: Value, policy: OperationPolicy) -> Result<Value>
where
    S: OperationSource + ?Sized,
{
    let mut elapsed = Duration::ZERO;
    let mut current = operation;
    loop {
        let name = match progress(&current)? {
            Progress::Done(response) => return Ok(response),
            Progress::Running(name) => name,
        };
        if elapsed >= policy.timeout {
            return Err(SetupError::Timeout(format!(
                "operation {} not done after {}s",
                name,
                policy.timeout.as_secs()
            )));
        }
        debug!(operation = %name, "waiting for operation");
        tokio::time::sleep(policy.period).await;
        elapsed += policy.period;
        current = source
            .poll(endpoint(base, &name, &[])?)
            .await?
            .ok_or_else(|| SetupError::api(404, format!("operation {} disappeared", name)))?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Answers polls from a script and records the polled URLs.
    struct Scripted {
        answers: Mutex<Vec<Value>>,
        polled: Mutex<Vec<Url>>,
    }

    impl Scripted {
        fn new(answers: Vec<Value>) -> Self {
            Self { answers: Mutex::new(answers), polled: Mutex::default() }
        }

        fn polled(&self) -> Vec<Url> {
            self.polled.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OperationSource for Scripted {
        async fn poll(&self, url: Url) -> Result<Option<Value>> {
            self.polled.lock().unwrap().push(url);
            let mut answers = self.answers.lock().unwrap();
            Ok(if answers.is_empty() { None } else { Some(answers.remove(0)) })
        }
    }

    const BASE: &str = "https://cloudresourcemanager.googleapis.com/v3";

    #[test]
    fn finished_operation_yields_response() {
        let op = json!({"name": "operations/cf.1", "done": true, "response": {"name": "folders/42"}});
        assert_eq!(progress(&op).unwrap(), Progress::Done(json!({"name": "folders/42"})));
    }

    #[test]
    fn finished_operation_without_response_is_empty() {
        let op = json!({"name": "operations/cf.1", "done": true});
        assert_eq!(progress(&op).unwrap(), Progress::Done(json!({})));
    }

    #[test]
    fn running_operation_is_polled_by_name() {
        let op = json!({"name": "projects/1/locations/global/workloadIdentityPools/p/operations/x"});
        assert_eq!(
            progress(&op).unwrap(),
            Progress::Running("projects/1/locations/global/workloadIdentityPools/p/operations/x".to_string())
        );
    }

    #[test]
    fn synchronous_answer_is_already_done() {
        let role = json!({"name": "organizations/1/roles/builderRole", "etag": "BwX"});
        assert_eq!(progress(&role).unwrap(), Progress::Done(role.clone()));
    }

    #[test]
    fn operation_error_is_surfaced() {
        let op = json!({"name": "operations/1", "done": true, "error": {"code": 7, "message": "denied"}});
        match progress(&op) {
            Err(SetupError::Api { status, message }) => {
                assert_eq!(status, 7);
                assert!(message.contains("denied"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn malformed_operation_is_rejected() {
        assert!(progress(&json!({"done": false})).is_err());
    }

    #[test]
    fn already_exists_operation_error_is_typed() {
        let op = json!({"name": "operations/cp.9", "done": true, "error": {"code": 6, "message": "project id taken"}});
        match progress(&op) {
            Err(SetupError::AlreadyExists { resource }) => assert!(resource.contains("project id taken")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhausted_timeout_fails_without_polling() {
        let source = Scripted::new(vec![json!({"name": "operations/cf.1", "done": true, "response": {}})]);
        let policy = OperationPolicy { period: Duration::from_millis(1), timeout: Duration::ZERO };
        let err = wait(&source, BASE, json!({"name": "operations/cf.1", "done": false}), policy)
            .await
            .unwrap_err();
        match err {
            SetupError::Timeout(message) => assert!(message.contains("operations/cf.1")),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(source.polled().is_empty());
    }

    #[tokio::test]
    async fn running_operation_is_polled_until_done() {
        let source = Scripted::new(vec![
            json!({"name": "operations/cf.2", "done": false}),
            json!({"name": "operations/cf.2", "done": true, "response": {"name": "folders/42"}}),
        ]);
        let policy = OperationPolicy { period: Duration::from_millis(1), timeout: Duration::from_secs(5) };
        let response = wait(&source, BASE, json!({"name": "operations/cf.2"}), policy).await.unwrap();
        assert_eq!(response, json!({"name": "folders/42"}));
        let polled = source.polled();
        assert_eq!(polled.len(), 2);
        assert_eq!(polled[0].path(), "/v3/operations/cf.2");
    }

    #[tokio::test]
    async fn vanished_operation_is_an_error() {
        let source = Scripted::new(Vec::new());
        let policy = OperationPolicy { period: Duration::from_millis(1), timeout: Duration::from_secs(5) };
        let err = wait(&source, BASE, json!({"name": "operations/cf.3"}), policy).await.unwrap_err();
        assert!(matches!(err, SetupError::Api { status: 404, .. }));
    }

    #[test]
    fn default_schedule() {
        let policy = OperationPolicy::default();
        assert_eq!(policy.period, Duration::from_secs(5));
        assert_eq!(policy.timeout, Duration::from_secs(60));
    }
}
