//! Per-pipeline helper container.
//!
//! The sidecar's sole purpose is to clone the repository onto a host
//! volume and share the resulting workspace, via a bind mount, with every
//! job container of the same pipeline.

use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error};

use snake_core::cloud::{Cloud, Container, ExecConfig, LogSink};
use snake_core::sshkey::SshKey;
use snake_core::{Error, Result};

use crate::logs::DebugSink;

pub const SIDECAR_IMAGE: &str = "reconquest/snake-runner-sidecar";

const SSH_CONFIG_NO_VERIFICATION: &str =
    "Host *\n\tStrictHostKeyChecking no\n\tUserKnownHostsFile /dev/null\n";

pub struct Sidecar {
    cloud: Arc<dyn Cloud>,
    name: String,
    slug: String,
    pipelines_dir: PathBuf,
    ssh_key: SshKey,

    container: Option<Container>,
    container_dir: String,
    host_sub_dir: String,
}

impl Sidecar {
    pub fn new(
        cloud: Arc<dyn Cloud>,
        name: String,
        slug: String,
        pipelines_dir: PathBuf,
        ssh_key: SshKey,
    ) -> Self {
        Self {
            cloud,
            name,
            slug,
            pipelines_dir,
            ssh_key,
            container: None,
            container_dir: String::new(),
            host_sub_dir: String::new(),
        }
    }

    /// The single bind mount job containers must inherit to see the
    /// cloned workspace at the same path as the sidecar.
    pub fn pipeline_volumes(&self) -> Vec<String> {
        vec![format!("{}:{}", self.host_sub_dir, self.container_dir)]
    }

    pub fn container_dir(&self) -> &str {
        &self.container_dir
    }

    pub fn container(&self) -> Option<&Container> {
        self.container.as_ref()
    }

    async fn create(&mut self, sink: &dyn LogSink) -> Result<Container> {
        if !self.cloud.has_image(SIDECAR_IMAGE).await? {
            self.cloud
                .pull_image(SIDECAR_IMAGE, sink)
                .await
                .map_err(|err| {
                    Error::Cloud(format!(
                        "unable to pull sidecar image {SIDECAR_IMAGE}: {err}"
                    ))
                })?;
        }

        self.host_sub_dir = format!("{}/{}", self.pipelines_dir.display(), self.name);
        self.container_dir = format!("/pipelines/{}", self.slug);

        let volumes = vec![
            format!("{}:{}:rw", self.host_sub_dir, self.container_dir),
            format!("{}:/host:rw", self.pipelines_dir.display()),
        ];

        let container = self
            .cloud
            .create_container(
                SIDECAR_IMAGE,
                &format!("snake-runner-sidecar-{}", self.name),
                &volumes,
            )
            .await
            .map_err(|err| Error::Cloud(format!("unable to create sidecar container: {err}")))?;

        self.container = Some(container.clone());
        Ok(container)
    }

    /// Bring the workspace up: create the container, provision SSH, clone
    /// the repository and check out the commitish. Clone and checkout
    /// output is forwarded to `sink`.
    pub async fn serve(
        &mut self,
        clone_url: &str,
        commitish: &str,
        sink: &dyn LogSink,
    ) -> Result<()> {
        let container = self.create(sink).await?;

        // The keys travel through the environment so that they never
        // appear in the argv of the exec'd command.
        let env = vec![
            format!("__SNAKE_PRIVATE_KEY={}", self.ssh_key.private),
            format!("__SNAKE_PUBLIC_KEY={}", self.ssh_key.public),
            format!("__SNAKE_SSH_CONFIG={}", SSH_CONFIG_NO_VERIFICATION),
        ];

        let prep = [
            r#"mkdir ~/.ssh"#,
            r#"cat > ~/.ssh/id_rsa <<< "$__SNAKE_PRIVATE_KEY""#,
            r#"cat > ~/.ssh/id_rsa.pub <<< "$__SNAKE_PUBLIC_KEY""#,
            r#"cat > ~/.ssh/config <<< "$__SNAKE_SSH_CONFIG""#,
            r#"chmod 0600 ~/.ssh/id_rsa ~/.ssh/id_rsa.pub"#,
            r#"git config --global advice.detachedHead false"#,
        ]
        .join(" && ");

        let cmd = vec!["bash".to_string(), "-c".to_string(), prep];
        self.cloud
            .exec(
                &container,
                ExecConfig::attached(cmd).with_env(env),
                &DebugSink::new("sidecar"),
            )
            .await
            .map_err(|err| Error::Cloud(format!("unable to prepare sidecar container: {err}")))?;

        let commands = [
            vec![
                "git".to_string(),
                "clone".to_string(),
                clone_url.to_string(),
                self.container_dir.clone(),
            ],
            vec![
                "git".to_string(),
                "-C".to_string(),
                self.container_dir.clone(),
                "checkout".to_string(),
                commitish.to_string(),
            ],
        ];

        for cmd in commands {
            sink.command(&cmd).await;

            // no environment: the keys are already on disk
            self.cloud
                .exec(&container, ExecConfig::attached(cmd.clone()), sink)
                .await
                .map_err(|err| {
                    Error::Cloud(format!("unable to set up repository: {cmd:?}: {err}"))
                })?;
        }

        Ok(())
    }

    /// Tear the sidecar down: wipe the host workspace, then remove the
    /// container. Idempotent and best-effort; failures are logged, never
    /// propagated. Runs to completion even when the pipeline's
    /// cancellation has already fired.
    pub async fn destroy(&mut self) {
        let Some(container) = self.container.take() else {
            return;
        };

        let sink = DebugSink::new("sidecar-teardown");

        if !self.name.is_empty() {
            let cmd = vec![
                "rm".to_string(),
                "-rf".to_string(),
                format!("/host/{}", self.name),
            ];

            debug!(container = %container.name, ?cmd, "Cleaning up sidecar workspace");

            if let Err(err) = self
                .cloud
                .exec(&container, ExecConfig::attached(cmd), &sink)
                .await
            {
                error!(
                    container = %container.name,
                    dir = %self.host_sub_dir,
                    error = %err,
                    "Unable to clean up sidecar workspace"
                );
            }
        }

        debug!(container = %container.name, "Destroying sidecar container");

        if let Err(err) = self.cloud.destroy_container(&container).await {
            error!(
                container = %container.name,
                error = %err,
                "Unable to destroy sidecar container"
            );
        }
    }
}

/// `pipeline-<id>-uniq-<suffix>`, unique per pipeline run.
pub fn unique_name(pipeline_id: i64) -> String {
    format!("pipeline-{}-uniq-{}", pipeline_id, rand_suffix(10))
}

/// Random lowercase suffix for container and workspace names.
pub(crate) fn rand_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| rng.gen_range(b'a'..=b'z') as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{CloudCall, MockCloud, NullSink};

    fn sidecar(cloud: Arc<MockCloud>) -> Sidecar {
        Sidecar::new(
            cloud,
            "pipeline-7-uniq-abcdefghij".to_string(),
            "PRJ/repo".to_string(),
            PathBuf::from("/var/lib/snake-runner/pipelines"),
            SshKey {
                private: "secret-private-key".to_string(),
                public: "ssh-rsa AAAA pub".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_serve_prepares_ssh_then_clones() {
        let cloud = Arc::new(MockCloud::new());
        let mut sidecar = sidecar(cloud.clone());

        sidecar
            .serve("ssh://git@example.com/prj/repo.git", "deadbeef", &NullSink)
            .await
            .unwrap();

        let calls = cloud.calls();
        assert_eq!(calls[0], CloudCall::HasImage(SIDECAR_IMAGE.to_string()));

        match &calls[1] {
            CloudCall::CreateContainer { name, volumes, .. } => {
                assert_eq!(name, "snake-runner-sidecar-pipeline-7-uniq-abcdefghij");
                assert_eq!(
                    volumes,
                    &vec![
                        "/var/lib/snake-runner/pipelines/pipeline-7-uniq-abcdefghij:/pipelines/PRJ/repo:rw"
                            .to_string(),
                        "/var/lib/snake-runner/pipelines:/host:rw".to_string(),
                    ]
                );
            }
            other => panic!("unexpected call: {other:?}"),
        }

        // ssh prep: key material travels via env, never via argv
        match &calls[2] {
            CloudCall::Exec { cmd, env, .. } => {
                assert_eq!(cmd[0], "bash");
                assert!(!cmd.join(" ").contains("secret-private-key"));
                assert!(env
                    .iter()
                    .any(|e| e == "__SNAKE_PRIVATE_KEY=secret-private-key"));
                assert!(env
                    .iter()
                    .any(|e| e == "__SNAKE_PUBLIC_KEY=ssh-rsa AAAA pub"));
                assert!(env
                    .iter()
                    .any(|e| e.starts_with("__SNAKE_SSH_CONFIG=Host *")));
            }
            other => panic!("unexpected call: {other:?}"),
        }

        // clone and checkout run with no environment
        match &calls[3] {
            CloudCall::Exec { cmd, env, .. } => {
                assert_eq!(
                    cmd,
                    &vec![
                        "git".to_string(),
                        "clone".to_string(),
                        "ssh://git@example.com/prj/repo.git".to_string(),
                        "/pipelines/PRJ/repo".to_string(),
                    ]
                );
                assert!(env.is_empty());
            }
            other => panic!("unexpected call: {other:?}"),
        }

        match &calls[4] {
            CloudCall::Exec { cmd, .. } => {
                assert_eq!(cmd[3], "checkout");
                assert_eq!(cmd[4], "deadbeef");
            }
            other => panic!("unexpected call: {other:?}"),
        }

        assert_eq!(
            sidecar.pipeline_volumes(),
            vec![
                "/var/lib/snake-runner/pipelines/pipeline-7-uniq-abcdefghij:/pipelines/PRJ/repo"
                    .to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_serve_pulls_missing_image() {
        let cloud = Arc::new(MockCloud::new());
        cloud.set_has_image(false);
        let mut sidecar = sidecar(cloud.clone());

        sidecar
            .serve("ssh://git@example.com/prj/repo.git", "main", &NullSink)
            .await
            .unwrap();

        assert_eq!(
            cloud.calls()[1],
            CloudCall::PullImage(SIDECAR_IMAGE.to_string())
        );
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let cloud = Arc::new(MockCloud::new());
        let mut sidecar = sidecar(cloud.clone());

        sidecar
            .serve("ssh://git@example.com/prj/repo.git", "main", &NullSink)
            .await
            .unwrap();

        sidecar.destroy().await;
        sidecar.destroy().await;

        let destroys = cloud
            .calls()
            .iter()
            .filter(|call| matches!(call, CloudCall::DestroyContainer { .. }))
            .count();
        assert_eq!(destroys, 1);

        // the host workspace wipe happened before the destroy
        let calls = cloud.calls();
        let wipe = calls
            .iter()
            .position(|call| {
                matches!(call, CloudCall::Exec { cmd, .. } if cmd.first().map(String::as_str) == Some("rm"))
            })
            .expect("workspace wipe exec");
        let destroy = calls
            .iter()
            .position(|call| matches!(call, CloudCall::DestroyContainer { .. }))
            .unwrap();
        assert!(wipe < destroy);
    }

    #[tokio::test]
    async fn test_destroy_without_container_is_a_noop() {
        let cloud = Arc::new(MockCloud::new());
        let mut sidecar = sidecar(cloud.clone());

        sidecar.destroy().await;

        assert!(cloud.calls().is_empty());
    }

    #[test]
    fn test_unique_name_shape() {
        let name = unique_name(42);
        assert!(name.starts_with("pipeline-42-uniq-"));
        let suffix = name.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 10);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase()));
    }
}
