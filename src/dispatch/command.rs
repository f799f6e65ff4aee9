//! Container command lines for the longitudinal processing tool.
//!
//! The tool is a black box: it receives the template id, timepoint ids,
//! input images and filtered options, writes under `/output`, and reports an
//! exit code. Each input image's directory is bound read-only at
//! `/input/<timepoint>` so images from different session folders never clash.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::{ContainerRuntime, OrchestratorConfig};

use super::job::JobDescriptor;

/// Entry script inside the FastSurfer image.
pub const LONG_ENTRYPOINT: &str = "/fastsurfer/long_fastsurfer.sh";

/// Mount point of the output root inside the container.
pub const CONTAINER_OUTPUT: &str = "/output";

/// Mount point of the license inside the container.
pub const CONTAINER_LICENSE: &str = "/fs_license/license.txt";

/// Mount root for input images inside the container.
pub const CONTAINER_INPUT: &str = "/input";

/// A program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ContainerCommand {
    /// Builds the container invocation for a descriptor.
    pub fn build(
        config: &OrchestratorConfig,
        descriptor: &JobDescriptor,
        output_root: &Path,
    ) -> Self {
        let mut binds: Vec<(String, String, bool)> = vec![
            (path_str(output_root), CONTAINER_OUTPUT.to_string(), false),
            (path_str(&config.license), CONTAINER_LICENSE.to_string(), true),
        ];
        let mut container_images = Vec::with_capacity(descriptor.images().len());
        for (timepoint, image) in descriptor.timepoints().iter().zip(descriptor.images()) {
            let host_dir = image
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            let mount = format!("{CONTAINER_INPUT}/{timepoint}");
            let file_name = image
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            container_images.push(format!("{mount}/{file_name}"));
            binds.push((path_str(&host_dir), mount, true));
        }
        for extra in &config.extra_binds {
            if let Some((host, container)) = extra.split_once(':') {
                binds.push((host.to_string(), container.to_string(), false));
            }
        }

        let (program, mut args) = match config.runtime {
            ContainerRuntime::Singularity => {
                let mut args = vec!["exec".to_string()];
                if config.gpu {
                    args.push("--nv".to_string());
                }
                args.push("--no-home".to_string());
                for (host, container, read_only) in &binds {
                    args.push("-B".to_string());
                    let suffix = if *read_only { ":ro" } else { "" };
                    args.push(format!("{host}:{container}{suffix}"));
                }
                args.push(config.image.clone());
                args.push(LONG_ENTRYPOINT.to_string());
                ("singularity".to_string(), args)
            }
            ContainerRuntime::Docker => {
                let mut args = vec!["run".to_string(), "--rm".to_string()];
                if config.gpu {
                    args.push("--gpus".to_string());
                    args.push("all".to_string());
                }
                for (host, container, read_only) in &binds {
                    args.push("-v".to_string());
                    let suffix = if *read_only { ":ro" } else { "" };
                    args.push(format!("{host}:{container}{suffix}"));
                }
                args.push("--entrypoint".to_string());
                args.push(LONG_ENTRYPOINT.to_string());
                args.push(config.image.clone());
                ("docker".to_string(), args)
            }
        };

        args.push("--tid".to_string());
        args.push(descriptor.template().to_string());
        args.push("--t1s".to_string());
        args.extend(container_images);
        args.push("--tpids".to_string());
        args.extend(descriptor.timepoints().iter().cloned());
        args.push("--sd".to_string());
        args.push(CONTAINER_OUTPUT.to_string());
        args.push("--fs_license".to_string());
        args.push(CONTAINER_LICENSE.to_string());
        args.extend(descriptor.options().iter().cloned());

        Self { program, args }
    }

    /// Renders the command as a copy-pasteable shell line.
    pub fn to_shell_string(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl std::fmt::Display for ContainerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_shell_string())
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,+@%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Session, Subject};
    use crate::dispatch::job::ExecutionMode;

    fn descriptor() -> JobDescriptor {
        let subject = Subject::new(
            "sub-002",
            vec![
                Session {
                    id: "ses-01".to_string(),
                    dir: PathBuf::from("/bids/sub-002/ses-01"),
                    image: Some(PathBuf::from(
                        "/bids/sub-002/ses-01/anat/sub-002_ses-01_T1w.nii.gz",
                    )),
                },
                Session {
                    id: "ses-02".to_string(),
                    dir: PathBuf::from("/bids/sub-002/ses-02"),
                    image: Some(PathBuf::from(
                        "/bids/sub-002/ses-02/anat/sub-002_ses-02_T1w.nii.gz",
                    )),
                },
            ],
        );
        JobDescriptor::new(
            &subject,
            vec!["--parallel".to_string(), "--threads".to_string(), "4".to_string()],
            ExecutionMode::Detached,
        )
        .expect("descriptor")
    }

    #[test]
    fn test_singularity_command() {
        let config = OrchestratorConfig::new("/images/fastsurfer.sif", "/opt/license.txt");
        let cmd = ContainerCommand::build(&config, &descriptor(), Path::new("/out"));

        assert_eq!(cmd.program, "singularity");
        assert_eq!(cmd.args[0], "exec");
        assert!(!cmd.args.contains(&"--nv".to_string()));
        assert!(cmd.args.contains(&"/out:/output".to_string()));
        assert!(cmd
            .args
            .contains(&"/opt/license.txt:/fs_license/license.txt:ro".to_string()));
        assert!(cmd
            .args
            .contains(&"/bids/sub-002/ses-01/anat:/input/sub-002_ses-01:ro".to_string()));

        let line = cmd.to_shell_string();
        assert!(line.contains("/images/fastsurfer.sif /fastsurfer/long_fastsurfer.sh --tid sub-002"));
        assert!(line.contains(
            "--t1s /input/sub-002_ses-01/sub-002_ses-01_T1w.nii.gz /input/sub-002_ses-02/sub-002_ses-02_T1w.nii.gz"
        ));
        assert!(line.contains("--tpids sub-002_ses-01 sub-002_ses-02 --sd /output"));
        assert!(line.ends_with("--parallel --threads 4"));
    }

    #[test]
    fn test_docker_command_with_gpu() {
        let mut config = OrchestratorConfig::new("deepmi/fastsurfer:latest", "/opt/license.txt")
            .with_runtime(ContainerRuntime::Docker);
        config.gpu = true;
        config.extra_binds = vec!["/scratch:/tmp".to_string()];

        let cmd = ContainerCommand::build(&config, &descriptor(), Path::new("/out"));
        assert_eq!(cmd.program, "docker");
        assert_eq!(&cmd.args[..4], &["run", "--rm", "--gpus", "all"]);
        assert!(cmd.args.contains(&"/scratch:/tmp".to_string()));

        let entry = cmd
            .args
            .iter()
            .position(|a| a == "--entrypoint")
            .expect("entrypoint flag");
        assert_eq!(cmd.args[entry + 1], LONG_ENTRYPOINT);
        assert_eq!(cmd.args[entry + 2], "deepmi/fastsurfer:latest");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain-arg_1.nii.gz"), "plain-arg_1.nii.gz");
        assert_eq!(shell_quote("with space"), "'with space'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
