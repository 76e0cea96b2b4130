//! First-boot configuration for launched instances.
//!
//! `build_user_data` emits the base64-encoded cloud-config document a
//! fresh VM consumes: credential files, the (gzipped) worker
//! configuration, disk formatting and mounting units, an optional
//! tracing sidecar, and the worker container unit itself. The whole
//! document must fit in the provider's 16 KiB user-data limit.

use std::io::Write as _;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;

use flow_core::{Error, ErrorKind};

/// Provider bound on user data.
pub const MAX_USER_DATA_BYTES: usize = 16 * 1024;

/// RAID-0 chunk size in KiB for multi-volume data disks.
const RAID_CHUNK_KIB: u32 = 256;

/// The smallest acceptable size per EBS volume, by volume type.
/// `st1` volumes cannot be created under 500 GiB; 335 GiB is the
/// smallest `gp2` volume that yields maximum throughput.
pub fn min_disk_size(ebs_type: &str) -> Option<u64> {
    match ebs_type {
        "st1" => Some(500),
        "gp2" => Some(335),
        _ => None,
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A file written at first boot.
#[derive(Debug, Clone, Serialize)]
pub struct CloudFile {
    pub path: String,
    pub permissions: String,
    pub owner: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    pub content: String,
}

/// A systemd unit managed by cloud-init.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CloudUnit {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(skip_serializing_if = "is_false")]
    pub enable: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize)]
struct UpdateConfig {
    #[serde(rename = "reboot-strategy", skip_serializing_if = "Option::is_none")]
    reboot_strategy: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
struct HostConfig {
    update: UpdateConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    units: Vec<CloudUnit>,
}

/// The cloud-config document.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CloudConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ssh_authorized_keys: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    write_files: Vec<CloudFile>,
    coreos: HostConfig,
}

impl CloudConfig {
    pub fn append_file(&mut self, file: CloudFile) {
        self.write_files.push(file);
    }

    pub fn append_unit(&mut self, unit: CloudUnit) {
        self.coreos.units.push(unit);
    }

    /// Fold another document into this one. The other document's
    /// files and units come after ours; our reboot strategy wins.
    pub fn merge(&mut self, other: CloudConfig) {
        self.ssh_authorized_keys.extend(other.ssh_authorized_keys);
        self.write_files.extend(other.write_files);
        self.coreos.units.extend(other.coreos.units);
        if self.coreos.update.reboot_strategy.is_none() {
            self.coreos.update.reboot_strategy = other.coreos.update.reboot_strategy;
        }
    }

    /// The document as YAML with the cloud-config header.
    pub fn marshal(&self) -> Result<String, Error> {
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| Error::fatal("cloud config", e.to_string()))?;
        Ok(format!("#cloud-config\n{yaml}"))
    }
}

/// Credentials for the optional tracing sidecar.
#[derive(Debug, Clone, Default)]
pub struct TraceAgent {
    pub instance_profile: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
}

/// Inputs to [`build_user_data`].
#[derive(Debug, Clone)]
pub struct BootParams {
    /// The login command file used to pull images from the private
    /// registry.
    pub registry_login: String,
    /// The full worker configuration; the cluster key is stripped
    /// before embedding, since the remote side needs no cluster
    /// implementation.
    pub worker_config_yaml: String,
    pub ssh_key: Option<String>,
    /// EBS volumes are exposed as NVMe devices.
    pub nvme: bool,
    /// Number of data volumes; more than one is assembled into a
    /// RAID-0.
    pub n_ebs: u32,
    /// Skip the poweroff-on-failure unit wiring.
    pub immortal: bool,
    /// The worker container image reference.
    pub worker_image: String,
    pub trace_agent: Option<TraceAgent>,
    /// Site-specific document merged in before the worker unit, so
    /// its units run first.
    pub extra: Option<CloudConfig>,
}

/// Build the base64-encoded user data for one instance.
pub fn build_user_data(params: &BootParams) -> Result<String, Error> {
    let mut doc = CloudConfig::default();

    if let Some(key) = &params.ssh_key {
        doc.ssh_authorized_keys.push(key.clone());
    }

    doc.append_file(CloudFile {
        path: "/etc/registry-login".to_string(),
        permissions: "0644".to_string(),
        owner: "root".to_string(),
        encoding: None,
        content: params.registry_login.clone(),
    });

    doc.append_file(CloudFile {
        path: "/etc/flowgrid.yaml".to_string(),
        permissions: "0644".to_string(),
        owner: "root".to_string(),
        encoding: Some("gzip+base64".to_string()),
        content: worker_config_content(&params.worker_config_yaml)?,
    });

    // Hold back host services that would restart or otherwise disrupt
    // the instance.
    doc.coreos.update.reboot_strategy = Some("off".to_string());
    doc.append_unit(CloudUnit {
        name: "update-engine.service".to_string(),
        command: "stop".to_string(),
        ..CloudUnit::default()
    });
    doc.append_unit(CloudUnit {
        name: "locksmithd.service".to_string(),
        command: "stop".to_string(),
        ..CloudUnit::default()
    });

    let data_device = append_disk_units(&mut doc, params.nvme, params.n_ebs);
    doc.append_unit(CloudUnit {
        name: "mnt-data.mount".to_string(),
        command: "start".to_string(),
        content: format!(
            "[Mount]
What=/dev/{data_device}
Where=/mnt/data
Type=ext4
Options=data=writeback
"
        ),
        ..CloudUnit::default()
    });

    if let Some(agent) = &params.trace_agent {
        append_trace_agent_unit(&mut doc, agent);
    }

    // The site document merges before the worker unit so its units
    // can run ahead of the worker.
    if let Some(extra) = &params.extra {
        doc.merge(extra.clone());
    }

    doc.append_unit(worker_unit(&params.worker_image, params.immortal));

    let yaml = doc.marshal()?;
    let encoded = BASE64.encode(yaml.as_bytes());
    if encoded.len() > MAX_USER_DATA_BYTES {
        return Err(Error::new(
            ErrorKind::Fatal,
            "cloud config",
            format!(
                "user data is {} bytes; the provider limit is {MAX_USER_DATA_BYTES}",
                encoded.len()
            ),
        ));
    }
    Ok(encoded)
}

/// Strip the cluster key from the worker configuration, then gzip and
/// base64 it to stay under the user-data limit.
fn worker_config_content(config_yaml: &str) -> Result<String, Error> {
    let mut keys: serde_yaml::Mapping = serde_yaml::from_str(config_yaml)
        .map_err(|e| Error::fatal("cloud config", format!("worker config: {e}")))?;
    keys.remove("cluster");
    let stripped = serde_yaml::to_string(&keys)
        .map_err(|e| Error::fatal("cloud config", e.to_string()))?;

    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(stripped.as_bytes())
        .and_then(|_| gz.finish())
        .map(|compressed| BASE64.encode(compressed))
        .map_err(|e| Error::fatal("cloud config", e.to_string()))
}

/// The name of a data device by index (0-based), honoring NVMe
/// exposure.
fn device_name(nvme: bool, index: u32) -> String {
    if nvme {
        format!("nvme{}n1", index + 1)
    } else {
        format!("xvd{}", (b'b' + index as u8) as char)
    }
}

/// Append format (and, for multiple volumes, RAID assembly) units.
/// Returns the device the data filesystem lives on.
fn append_disk_units(doc: &mut CloudConfig, nvme: bool, n_ebs: u32) -> String {
    if n_ebs <= 1 {
        let name = device_name(nvme, 0);
        doc.append_unit(CloudUnit {
            name: format!("format-{name}.service"),
            command: "start".to_string(),
            content: format!(
                "[Unit]
Description=Format /dev/{name}
After=dev-{name}.device
Requires=dev-{name}.device
[Service]
Type=oneshot
RemainAfterExit=yes
ExecStart=/usr/sbin/wipefs -f /dev/{name}
ExecStart=/usr/sbin/mkfs.ext4 -F /dev/{name}
"
            ),
            ..CloudUnit::default()
        });
        return name;
    }

    let devices: Vec<String> = (0..n_ebs).map(|i| device_name(nvme, i)).collect();
    let after = devices
        .iter()
        .map(|d| format!("dev-{d}.device"))
        .collect::<Vec<_>>()
        .join(" ");
    let members = devices
        .iter()
        .map(|d| format!("/dev/{d}"))
        .collect::<Vec<_>>()
        .join(" ");
    doc.append_unit(CloudUnit {
        name: "format-md0.service".to_string(),
        command: "start".to_string(),
        content: format!(
            "[Unit]
Description=Format /dev/md0
After={after}
Requires={after}
[Service]
Type=oneshot
RemainAfterExit=yes
ExecStart=/usr/sbin/mdadm --create --run --verbose /dev/md0 --level=0 --chunk={RAID_CHUNK_KIB} --name=flowgrid --raid-devices={n} {members}
ExecStart=/usr/sbin/mkfs.ext4 -F /dev/md0
",
            n = devices.len(),
        ),
        ..CloudUnit::default()
    });
    "md0".to_string()
}

fn append_trace_agent_unit(doc: &mut CloudConfig, agent: &TraceAgent) {
    let profile = agent
        .instance_profile
        .as_deref()
        .map(|p| format!("-a {p}"))
        .unwrap_or_default();
    let env = |name: &str, value: &Option<String>| {
        format!("Environment=\"{name}={}\"", value.clone().unwrap_or_default())
    };
    doc.append_unit(CloudUnit {
        name: "trace-agent.service".to_string(),
        enable: true,
        command: "start".to_string(),
        content: format!(
            "[Unit]
Description=trace agent
Requires=network.target
After=network.target
[Service]
{akey}
{secret}
{token}
Type=simple
ExecStartPre=/usr/bin/wget https://s3.dualstack.us-east-2.amazonaws.com/aws-xray-assets.us-east-2/xray-daemon/aws-xray-daemon-linux-2.x.zip
ExecStartPre=/usr/bin/unzip aws-xray-daemon-linux-2.x.zip -d /tmp
ExecStart=/tmp/xray {profile} -l debug
",
            akey = env("AWS_ACCESS_KEY_ID", &agent.access_key_id),
            secret = env("AWS_SECRET_ACCESS_KEY", &agent.secret_access_key),
            token = env("AWS_SESSION_TOKEN", &agent.session_token),
        ),
        ..CloudUnit::default()
    });
}

/// The worker container unit. A mortal worker's crash powers the
/// machine off, so a worker failure never leaves a tenant-less
/// instance running.
fn worker_unit(image: &str, immortal: bool) -> CloudUnit {
    let on_failure = if immortal {
        String::new()
    } else {
        "OnFailure=poweroff.target
OnFailureJobMode=replace-irreversibly
"
        .to_string()
    };
    CloudUnit {
        name: "worker.service".to_string(),
        enable: true,
        command: "start".to_string(),
        content: format!(
            "[Unit]
Description=flowgrid worker
Requires=network.target
After=network.target
{on_failure}[Service]
OOMScoreAdjust=-1000
Type=oneshot
ExecStartPre=-/usr/bin/docker stop %n
ExecStartPre=-/usr/bin/docker rm %n
ExecStartPre=/bin/bash /etc/registry-login
ExecStartPre=/usr/bin/docker pull {image}
ExecStart=/usr/bin/docker run --oom-score-adj -1000 --rm --name %n --net=host \\
  -v /:/host \\
  -v /var/run/docker.sock:/var/run/docker.sock \\
  -v '/etc/ssl/certs/ca-certificates.crt:/etc/ssl/certs/ca-certificates.crt' \\
  {image} worker --prefix /host --cluster --config /host/etc/flowgrid.yaml
"
        ),
    }
}
