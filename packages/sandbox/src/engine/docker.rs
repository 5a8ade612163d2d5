// ABOUTME: Docker engine adapter for local container-backed sandboxes
// ABOUTME: Uses bollard for container lifecycle, attached exec streams and tar copy endpoints

use super::{
    CopyProgress, EngineAdapter, EngineError, EngineHandle, EntryStream, ExecEvent, ExecRequest,
    ExecStream, OutputChunk, ProvisionOptions, Result,
};
use crate::archive::{normalize_entries, ArchiveCodec, ArchiveEntry, EntryKind, TarCodec};
use crate::templates::RuntimeTemplate;
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, DownloadFromContainerOptions, LogOutput,
        RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
        UploadToContainerOptions,
    },
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    Docker,
};
use futures::{Stream, StreamExt};
use sandpit_config::constants::{SANDPIT_DOCKER_PULL_TIMEOUT_SECS, SANDPIT_LABEL_PREFIX};
use sandpit_config::{parse_env_duration_secs, parse_env_or_default};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_LABEL_PREFIX: &str = "sandpit.sandbox";
const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(600);

type LogStream = Pin<Box<dyn Stream<Item = std::result::Result<LogOutput, bollard::errors::Error>> + Send>>;

pub struct DockerEngine {
    client: Docker,
    label_prefix: String,
    /// Images pulled by this engine, keyed by reference
    image_cache: Arc<RwLock<HashMap<String, chrono::DateTime<chrono::Utc>>>>,
    pull_timeout: Duration,
}

impl DockerEngine {
    /// Connect to the local daemon, reading the pull timeout and label prefix from the environment
    pub fn new() -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| EngineError::ConnectionError(e.to_string()))?;

        let mut engine = Self::with_client(client);
        engine.pull_timeout =
            parse_env_duration_secs(SANDPIT_DOCKER_PULL_TIMEOUT_SECS, DEFAULT_PULL_TIMEOUT);
        engine.label_prefix =
            parse_env_or_default(SANDPIT_LABEL_PREFIX, DEFAULT_LABEL_PREFIX.to_string());
        Ok(engine)
    }

    /// Create with a specific Docker connection and default settings
    pub fn with_client(client: Docker) -> Self {
        Self {
            client,
            label_prefix: DEFAULT_LABEL_PREFIX.to_string(),
            image_cache: Arc::new(RwLock::new(HashMap::new())),
            pull_timeout: DEFAULT_PULL_TIMEOUT,
        }
    }

    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    pub fn with_label_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.label_prefix = prefix.into();
        self
    }

    /// Convert a template plus per-sandbox options to bollard config
    fn to_bollard_config(
        &self,
        template: &RuntimeTemplate,
        options: &ProvisionOptions,
    ) -> Config<String> {
        let mut labels: HashMap<String, String> = options
            .labels
            .iter()
            .map(|(k, v)| (format!("{}.{}", self.label_prefix, k), v.clone()))
            .collect();
        labels.insert(format!("{}.managed", self.label_prefix), "true".to_string());
        labels.insert(
            format!("{}.template", self.label_prefix),
            template.name.clone(),
        );

        let exposed_ports: HashMap<String, HashMap<(), ()>> = template
            .exposed_ports
            .iter()
            .map(|port| (port.to_string(), HashMap::new()))
            .collect();

        let env: Vec<String> = options
            .env_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let host_config = bollard::models::HostConfig {
            publish_all_ports: Some(!exposed_ports.is_empty()),
            ..Default::default()
        };

        Config {
            image: Some(template.image_ref.clone()),
            cmd: if template.default_cmd.is_empty() {
                None
            } else {
                Some(template.default_cmd.clone())
            },
            user: template.user.clone(),
            env: Some(env),
            working_dir: Some(template.working_dir.clone()),
            labels: Some(labels),
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(EngineError::ImageError(e.to_string())),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        if self.image_exists(image).await? {
            debug!("Image {} already present", image);
            return Ok(());
        }
        if self.image_cache.write().await.remove(image).is_some() {
            info!("Image {} was deleted outside of sandpit, pulling again", image);
        }

        info!("Pulling image: {} (timeout: {:?})", image, self.pull_timeout);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);

        let result = tokio::time::timeout(self.pull_timeout, async {
            let mut last_status = String::new();
            let mut progress_update_count = 0;

            while let Some(result) = stream.next().await {
                let info = result.map_err(|e| {
                    EngineError::ImageError(format!("Failed to pull image {}: {}", image, e))
                })?;
                if let Some(status) = &info.status {
                    if status != &last_status {
                        debug!("Pull status: {}", status);
                        last_status = status.clone();
                    }
                    progress_update_count += 1;
                    if progress_update_count % 10 == 0 {
                        info!("Image pull progress: {}", status);
                    }
                }
                if let Some(error) = info.error {
                    return Err(EngineError::ImageError(format!(
                        "Failed to pull image {}: {}",
                        image, error
                    )));
                }
            }
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!("Successfully pulled image: {}", image);
                self.image_cache
                    .write()
                    .await
                    .insert(image.to_string(), chrono::Utc::now());
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(EngineError::Timeout(self.pull_timeout)),
        }
    }

    /// Run a command to completion, discarding output, and return its exit code
    async fn run_to_completion(&self, container_id: &str, command: Vec<String>) -> Result<i64> {
        let exec = self
            .client
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(command),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| EngineError::ExecError(e.to_string()))?;

        match self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| EngineError::ExecError(e.to_string()))?
        {
            StartExecResults::Attached { mut output, .. } => {
                while output.next().await.is_some() {}
            }
            StartExecResults::Detached => {
                return Err(EngineError::ExecError(
                    "Exec was detached unexpectedly".to_string(),
                ))
            }
        }

        exit_code(&self.client, &exec.id)
            .await?
            .ok_or_else(|| EngineError::ExecError(format!("Exec {} never reported an exit code", exec.id)))
    }
}

/// Poll the exec's exit code; the daemon can lag a little behind the end of the output stream
async fn exit_code(client: &Docker, exec_id: &str) -> Result<Option<i64>> {
    for _ in 0..20 {
        let inspect = client
            .inspect_exec(exec_id)
            .await
            .map_err(|e| EngineError::ExecError(e.to_string()))?;
        if inspect.running != Some(true) {
            return Ok(inspect.exit_code);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(None)
}

async fn pump_output(
    client: Docker,
    exec_id: String,
    mut output: LogStream,
    tx: mpsc::Sender<ExecEvent>,
) {
    while let Some(message) = output.next().await {
        let chunk = match message {
            Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                OutputChunk::stdout(message.to_vec())
            }
            Ok(LogOutput::StdErr { message }) => OutputChunk::stderr(message.to_vec()),
            Ok(LogOutput::StdIn { .. }) => continue,
            Err(e) => {
                warn!("Output stream of exec {} failed: {}", exec_id, e);
                break;
            }
        };
        if tx.send(ExecEvent::Output(chunk)).await.is_err() {
            return;
        }
    }

    match exit_code(&client, &exec_id).await {
        Ok(Some(code)) => {
            let _ = tx.send(ExecEvent::Exit(code)).await;
        }
        Ok(None) => warn!("Exec {} finished without an exit code", exec_id),
        Err(e) => warn!("Failed to inspect exec {}: {}", exec_id, e),
    }
}

fn is_status(err: &bollard::errors::Error, code: u16) -> bool {
    matches!(err, bollard::errors::Error::DockerResponseServerError { status_code, .. } if *status_code == code)
}

/// Docker archives are rooted at the basename of the requested path; strip that component
fn strip_archive_root(entries: Vec<ArchiveEntry>) -> Vec<ArchiveEntry> {
    if entries.len() == 1 && entries[0].kind != EntryKind::Directory && !entries[0].path.contains('/') {
        return entries;
    }

    entries
        .into_iter()
        .filter_map(|mut entry| {
            let rest = entry.path.split_once('/').map(|(_, rest)| rest.to_string())?;
            entry.path = rest;
            Some(entry)
        })
        .collect()
}

#[async_trait]
impl EngineAdapter for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn is_available(&self) -> Result<bool> {
        match self.client.ping().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Docker not available: {}", e);
                Ok(false)
            }
        }
    }

    async fn provision(
        &self,
        template: &RuntimeTemplate,
        options: &ProvisionOptions,
    ) -> Result<EngineHandle> {
        info!("Creating container {} from {}", options.name, template.image_ref);

        self.pull_image(&template.image_ref).await?;

        let config = self.to_bollard_config(template, options);
        let create = CreateContainerOptions {
            name: options.name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(create), config)
            .await
            .map_err(|e| EngineError::ContainerError(e.to_string()))?;

        debug!("Created container: {}", container.id);
        Ok(EngineHandle::new(container.id))
    }

    async fn start(&self, handle: &EngineHandle) -> Result<()> {
        info!("Starting container: {}", handle);

        match self
            .client
            .start_container(handle.as_str(), None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 304) => Ok(()),
            Err(e) if is_status(&e, 404) => Err(EngineError::NotFound(handle.to_string())),
            Err(e) => Err(EngineError::ContainerError(e.to_string())),
        }
    }

    async fn exec(&self, handle: &EngineHandle, request: ExecRequest) -> Result<ExecStream> {
        debug!("Executing in container {}: {:?}", handle, request.command);

        let env: Vec<String> = request
            .env_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let exec_config = CreateExecOptions {
            cmd: Some(request.command),
            env: if env.is_empty() { None } else { Some(env) },
            user: request.user,
            working_dir: request.working_dir,
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(handle.as_str(), exec_config)
            .await
            .map_err(|e| EngineError::ExecError(e.to_string()))?;

        let (output, mut input) = match self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| EngineError::ExecError(e.to_string()))?
        {
            StartExecResults::Attached { output, input } => (output, input),
            StartExecResults::Detached => {
                return Err(EngineError::ExecError(
                    "Exec was detached unexpectedly".to_string(),
                ))
            }
        };

        let (in_tx, mut in_rx) = mpsc::channel::<Vec<u8>>(64);
        let (out_tx, out_rx) = mpsc::channel(request.buffer.max(1));
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    data = in_rx.recv() => match data {
                        Some(data) => {
                            if let Err(e) = input.write_all(&data).await {
                                debug!("Exec stdin closed: {}", e);
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = input.shutdown().await;
        });

        let token = cancel.clone();
        let client = self.client.clone();
        let exec_id = exec.id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => debug!("Exec {} cancelled", exec_id),
                _ = pump_output(client, exec_id.clone(), output, out_tx) => {}
            }
        });

        Ok(ExecStream {
            input: in_tx,
            output: out_rx,
            cancel,
        })
    }

    async fn copy_out(&self, handle: &EngineHandle, path: &str) -> Result<EntryStream> {
        info!("Copying container {}:{} out", handle, path);

        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let mut stream = self
            .client
            .download_from_container(handle.as_str(), Some(options));

        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| {
                if is_status(&e, 404) {
                    EngineError::NotFound(format!("{}:{}", handle, path))
                } else {
                    EngineError::CopyError(e.to_string())
                }
            })?;
            data.extend_from_slice(&bytes);
        }

        let entries = TarCodec
            .unpack(&data)
            .map_err(|e| EngineError::CopyError(e.to_string()))?;
        let entries = strip_archive_root(entries);

        Ok(futures::stream::iter(entries.into_iter().map(Ok)).boxed())
    }

    async fn copy_in(
        &self,
        handle: &EngineHandle,
        dest: &str,
        mut entries: EntryStream,
        progress: CopyProgress,
    ) -> Result<u64> {
        info!("Copying into container {}:{}", handle, dest);

        let mut collected = Vec::new();
        while let Some(item) = entries.next().await {
            collected.push(item.map_err(|e| EngineError::CopyInterrupted {
                entries_written: 0,
                reason: e.to_string(),
            })?);
        }
        let collected =
            normalize_entries(collected).map_err(|e| EngineError::CopyError(e.to_string()))?;

        let code = self
            .run_to_completion(
                handle.as_str(),
                vec!["mkdir".to_string(), "-p".to_string(), dest.to_string()],
            )
            .await?;
        if code != 0 {
            return Err(EngineError::CopyError(format!(
                "Could not create {} (mkdir exited with {})",
                dest, code
            )));
        }

        let tar_data = TarCodec
            .pack(&collected)
            .map_err(|e| EngineError::CopyError(e.to_string()))?;

        let options = UploadToContainerOptions {
            path: dest.to_string(),
            ..Default::default()
        };
        self.client
            .upload_to_container(handle.as_str(), Some(options), tar_data.into())
            .await
            .map_err(|e| EngineError::CopyInterrupted {
                entries_written: 0,
                reason: e.to_string(),
            })?;

        // The daemon applies the archive as a whole
        let written = collected.len() as u64;
        progress.set(written);
        Ok(written)
    }

    async fn stop(&self, handle: &EngineHandle, timeout: Duration) -> Result<()> {
        info!("Stopping container: {} (timeout: {:?})", handle, timeout);

        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        match self.client.stop_container(handle.as_str(), Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 304) => Ok(()),
            Err(e) if is_status(&e, 404) => Err(EngineError::NotFound(handle.to_string())),
            Err(e) => Err(EngineError::ContainerError(e.to_string())),
        }
    }

    async fn destroy(&self, handle: &EngineHandle) -> Result<()> {
        info!("Removing container: {}", handle);

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.client.remove_container(handle.as_str(), Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 404) => Err(EngineError::NotFound(handle.to_string())),
            Err(e) => Err(EngineError::ContainerError(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::PortSpec;

    fn engine() -> Option<DockerEngine> {
        Docker::connect_with_local_defaults()
            .ok()
            .map(DockerEngine::with_client)
    }

    #[tokio::test]
    async fn test_container_config_conversion() {
        let Some(engine) = engine() else { return };
        let template = RuntimeTemplate::new("node", "node:20-alpine", "/app")
            .with_default_cmd(["tail", "-f", "/dev/null"])
            .with_user("node")
            .with_port("3000/tcp".parse::<PortSpec>().unwrap());
        let options = ProvisionOptions {
            name: "sandpit-sbx-test".to_string(),
            labels: HashMap::from([("id".to_string(), "sbx-test".to_string())]),
            env_vars: HashMap::from([("FOO".to_string(), "bar".to_string())]),
        };

        let config = engine.to_bollard_config(&template, &options);

        assert_eq!(config.image.as_deref(), Some("node:20-alpine"));
        assert_eq!(config.user.as_deref(), Some("node"));
        assert_eq!(config.working_dir.as_deref(), Some("/app"));
        assert_eq!(config.env, Some(vec!["FOO=bar".to_string()]));
        let labels = config.labels.unwrap();
        assert_eq!(labels.get("sandpit.sandbox.managed").map(String::as_str), Some("true"));
        assert_eq!(labels.get("sandpit.sandbox.id").map(String::as_str), Some("sbx-test"));
        assert!(config.exposed_ports.unwrap().contains_key("3000/tcp"));
    }

    #[tokio::test]
    async fn test_template_without_ports_or_cmd() {
        let Some(engine) = engine() else { return };
        let template = RuntimeTemplate::new("cpp", "gcc:13", "/app");
        let config = engine.to_bollard_config(&template, &ProvisionOptions::default());
        assert!(config.cmd.is_none());
        assert!(config.exposed_ports.is_none());
        assert!(config.user.is_none());
    }

    #[test]
    fn test_strip_archive_root() {
        let dir = strip_archive_root(vec![
            ArchiveEntry::directory("app"),
            ArchiveEntry::directory("app/src"),
            ArchiveEntry::file("app/src/main.py", b"print(1)".to_vec()),
        ]);
        let paths: Vec<_> = dir.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["src", "src/main.py"]);

        let single = strip_archive_root(vec![ArchiveEntry::file("out.txt", b"x".to_vec())]);
        assert_eq!(single[0].path, "out.txt");
    }
}
