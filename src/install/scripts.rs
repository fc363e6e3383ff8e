//! Built-in install scripts and kubelet unit files

use std::fmt;

/// pkgs.k8s.io channel used when no version is pinned
pub const DEFAULT_CHANNEL: &str = "v1.30";

/// Where distribution packages put kubeadm
pub const PACKAGED_KUBEADM: &str = "/usr/bin/kubeadm";

/// Package manager family of the node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Apt,
    Dnf,
    Zypper,
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageManager::Apt => write!(f, "apt"),
            PackageManager::Dnf => write!(f, "dnf"),
            PackageManager::Zypper => write!(f, "zypper"),
        }
    }
}

/// Parsed subset of `/etc/os-release`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsRelease {
    pub id: String,
    pub id_like: Vec<String>,
    pub version_id: Option<String>,
}

impl OsRelease {
    pub fn parse(content: &str) -> Self {
        let mut release = Self::default();
        for line in content.lines() {
            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').trim_matches('\'');
            match key {
                "ID" => release.id = value.to_lowercase(),
                "ID_LIKE" => {
                    release.id_like = value.split_whitespace().map(str::to_lowercase).collect()
                }
                "VERSION_ID" => release.version_id = Some(value.to_string()),
                _ => {}
            }
        }
        release
    }

    /// Package manager for this distribution, `None` when unsupported
    pub fn package_manager(&self) -> Option<PackageManager> {
        let ids = std::iter::once(self.id.as_str()).chain(self.id_like.iter().map(String::as_str));
        for id in ids {
            let pm = match id {
                "debian" | "ubuntu" => Some(PackageManager::Apt),
                "rhel" | "centos" | "fedora" | "rocky" | "almalinux" => Some(PackageManager::Dnf),
                "sles" | "suse" | "opensuse" => Some(PackageManager::Zypper),
                id if id.starts_with("opensuse") => Some(PackageManager::Zypper),
                _ => None,
            };
            if pm.is_some() {
                return pm;
            }
        }
        None
    }

    pub fn describe(&self) -> String {
        match &self.version_id {
            Some(version) => format!("{} {}", self.id, version),
            None => self.id.clone(),
        }
    }
}

const PRELUDE: &str = r#"#!/bin/sh
set -eu

version="${KUBEADM_VERSION:-}"
version="${version#v}"
if [ -n "$version" ]; then
    channel="v$(echo "$version" | cut -d. -f1,2)"
else
    channel="__DEFAULT_CHANNEL__"
fi
# a full x.y.z version pins the packages, x.y only picks the channel
patch="$(echo "$version" | cut -s -d. -f3)"
"#;

const APT: &str = r#"
export DEBIAN_FRONTEND=noninteractive
apt-get update -q
apt-get install -y -q apt-transport-https ca-certificates curl gpg
mkdir -p -m 755 /etc/apt/keyrings
curl -fsSL "https://pkgs.k8s.io/core:/stable:/${channel}/deb/Release.key" \
    | gpg --dearmor --yes -o /etc/apt/keyrings/kubernetes-apt-keyring.gpg
echo "deb [signed-by=/etc/apt/keyrings/kubernetes-apt-keyring.gpg] https://pkgs.k8s.io/core:/stable:/${channel}/deb/ /" \
    > /etc/apt/sources.list.d/kubernetes.list
apt-get update -q
if [ -n "$patch" ]; then
    apt-get install -y -q --allow-change-held-packages \
        "kubelet=${version}-*" "kubeadm=${version}-*" "kubectl=${version}-*"
else
    apt-get install -y -q --allow-change-held-packages kubelet kubeadm kubectl
fi
apt-mark hold kubelet kubeadm kubectl
"#;

const DNF: &str = r#"
pm=dnf
command -v dnf >/dev/null 2>&1 || pm=yum
cat > /etc/yum.repos.d/kubernetes.repo <<EOF
[kubernetes]
name=Kubernetes
baseurl=https://pkgs.k8s.io/core:/stable:/${channel}/rpm/
enabled=1
gpgcheck=1
gpgkey=https://pkgs.k8s.io/core:/stable:/${channel}/rpm/repodata/repomd.xml.key
exclude=kubelet kubeadm kubectl cri-tools kubernetes-cni
EOF
if [ -n "$patch" ]; then
    "$pm" install -y --disableexcludes=kubernetes \
        "kubelet-${version}" "kubeadm-${version}" "kubectl-${version}"
else
    "$pm" install -y --disableexcludes=kubernetes kubelet kubeadm kubectl
fi
"#;

const ZYPPER: &str = r#"
rpm --import "https://pkgs.k8s.io/core:/stable:/${channel}/rpm/repodata/repomd.xml.key"
zypper --non-interactive removerepo kubernetes >/dev/null 2>&1 || true
zypper --non-interactive addrepo --refresh "https://pkgs.k8s.io/core:/stable:/${channel}/rpm/" kubernetes
zypper --non-interactive --gpg-auto-import-keys refresh kubernetes
zypper --non-interactive install -y kubelet kubeadm kubectl
"#;

const EPILOGUE: &str = r#"
target="${KUBEADM_PATH:-__PACKAGED_KUBEADM__}"
case "$target" in
    /*)
        if [ "$target" != "__PACKAGED_KUBEADM__" ]; then
            mkdir -p "$(dirname "$target")"
            ln -sf __PACKAGED_KUBEADM__ "$target"
        fi
        ;;
esac
"#;

/// Install script for `pm`, configured through the environment
pub fn install_script(pm: PackageManager) -> String {
    let body = match pm {
        PackageManager::Apt => APT,
        PackageManager::Dnf => DNF,
        PackageManager::Zypper => ZYPPER,
    };
    [PRELUDE, body, EPILOGUE]
        .concat()
        .replace("__DEFAULT_CHANNEL__", DEFAULT_CHANNEL)
        .replace("__PACKAGED_KUBEADM__", PACKAGED_KUBEADM)
}

/// `/etc/sysconfig/kubelet`
pub fn kubelet_sysconfig() -> String {
    "KUBELET_EXTRA_ARGS=\n".to_string()
}

/// `kubelet.service`
pub fn kubelet_service() -> String {
    r#"[Unit]
Description=kubelet: The Kubernetes Node Agent
Documentation=https://kubernetes.io/docs/
Wants=network-online.target
After=network-online.target

[Service]
ExecStart=/usr/bin/kubelet
Restart=always
StartLimitInterval=0
RestartSec=10

[Install]
WantedBy=multi-user.target
"#
    .to_string()
}

/// kubeadm drop-in for the kubelet unit, reading extra args from `sysconfig_path`
pub fn kubeadm_dropin(sysconfig_path: &str) -> String {
    format!(
        r#"[Service]
Environment="KUBELET_KUBECONFIG_ARGS=--bootstrap-kubeconfig=/etc/kubernetes/bootstrap-kubelet.conf --kubeconfig=/etc/kubernetes/kubelet.conf"
Environment="KUBELET_CONFIG_ARGS=--config=/var/lib/kubelet/config.yaml"
EnvironmentFile=-/var/lib/kubelet/kubeadm-flags.env
EnvironmentFile=-{}
ExecStart=
ExecStart=/usr/bin/kubelet $KUBELET_KUBECONFIG_ARGS $KUBELET_CONFIG_ARGS $KUBELET_KUBEADM_ARGS $KUBELET_EXTRA_ARGS
"#,
        sysconfig_path
    )
}
