//! Image configuration accessors and mutators.

use chrono::{DateTime, Utc};

use super::{Builder, LinkedLayer};
use crate::define::ManifestType;
use crate::image::{HealthConfig, History};

impl Builder {
    fn warn_docker_only(&self, what: &str, value: &str) {
        if !value.is_empty() && self.format != ManifestType::Docker {
            tracing::warn!(
                setting = what,
                value = %value,
                "Setting is not supported for OCI image format and will be ignored. Must use `docker` format"
            );
        }
    }

    // ---- annotations ----

    pub fn annotations(&self) -> &std::collections::BTreeMap<String, String> {
        &self.image_annotations
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.image_annotations
            .insert(key.to_string(), value.to_string());
    }

    pub fn unset_annotation(&mut self, key: &str) {
        self.image_annotations.remove(key);
    }

    pub fn clear_annotations(&mut self) {
        self.image_annotations.clear();
    }

    // ---- history bookkeeping ----

    pub fn created_by(&self) -> &str {
        &self.image_created_by
    }

    pub fn set_created_by(&mut self, how: &str) {
        self.image_created_by = how.to_string();
    }

    pub fn history_comment(&self) -> &str {
        &self.image_history_comment
    }

    pub fn set_history_comment(&mut self, comment: &str) {
        self.image_history_comment = comment.to_string();
    }

    /// Docker format only
    pub fn set_comment(&mut self, comment: &str) {
        self.warn_docker_only("COMMENT", comment);
        self.config.comment = comment.to_string();
    }

    // ---- platform ----

    pub fn os(&self) -> &str {
        &self.config.os
    }

    pub fn set_os(&mut self, os: &str) {
        self.config.os = os.to_string();
    }

    pub fn set_os_version(&mut self, version: &str) {
        self.config.os_version = version.to_string();
    }

    pub fn set_os_feature(&mut self, feature: &str) {
        if !self.config.os_features.iter().any(|f| f == feature) {
            self.config.os_features.push(feature.to_string());
        }
    }

    pub fn unset_os_feature(&mut self, feature: &str) {
        self.config.os_features.retain(|f| f != feature);
    }

    pub fn clear_os_features(&mut self) {
        self.config.os_features.clear();
    }

    pub fn architecture(&self) -> &str {
        &self.config.architecture
    }

    pub fn set_architecture(&mut self, arch: &str) {
        self.config.architecture = crate::image::normalize_arch(arch);
    }

    pub fn set_variant(&mut self, variant: &str) {
        self.config.variant = variant.to_string();
    }

    // ---- authorship ----

    /// OCI `author`
    pub fn set_author(&mut self, who: &str) {
        self.config.author = who.to_string();
    }

    /// Docker `author`
    pub fn set_maintainer(&mut self, who: &str) {
        self.config.maintainer = who.to_string();
    }

    // ---- process defaults ----

    pub fn user(&self) -> &str {
        &self.config.config.user
    }

    pub fn set_user(&mut self, spec: &str) {
        self.config.config.user = spec.to_string();
    }

    pub fn work_dir(&self) -> &str {
        &self.config.config.working_dir
    }

    pub fn set_workdir(&mut self, there: &str) {
        self.config.config.working_dir = there.to_string();
    }

    pub fn shell(&self) -> &[String] {
        &self.config.config.shell
    }

    /// Docker format only
    pub fn set_shell(&mut self, shell: &[String]) {
        self.warn_docker_only("SHELL", &shell.join(" "));
        self.config.config.shell = shell.to_vec();
    }

    pub fn env(&self) -> &[String] {
        &self.config.config.env
    }

    /// Set `key=value`, replacing any earlier value.
    pub fn set_env(&mut self, key: &str, value: &str) {
        self.unset_env(key);
        self.config.config.env.push(format!("{}={}", key, value));
    }

    pub fn unset_env(&mut self, key: &str) {
        let prefix = format!("{}=", key);
        self.config.config.env.retain(|e| !e.starts_with(&prefix));
    }

    pub fn clear_env(&mut self) {
        self.config.config.env.clear();
    }

    pub fn cmd(&self) -> Option<&[String]> {
        self.config.config.cmd.as_deref()
    }

    pub fn set_cmd(&mut self, cmd: Option<Vec<String>>) {
        self.config.config.cmd = cmd;
    }

    pub fn entrypoint(&self) -> Option<&[String]> {
        self.config
            .config
            .entrypoint
            .as_deref()
            .filter(|e| !e.is_empty())
    }

    pub fn set_entrypoint(&mut self, entrypoint: Option<Vec<String>>) {
        self.config.config.entrypoint = entrypoint;
    }

    pub fn labels(&self) -> &std::collections::BTreeMap<String, String> {
        &self.config.config.labels
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.config
            .config
            .labels
            .insert(key.to_string(), value.to_string());
    }

    pub fn unset_label(&mut self, key: &str) {
        self.config.config.labels.remove(key);
    }

    pub fn clear_labels(&mut self) {
        self.config.config.labels.clear();
    }

    pub fn ports(&self) -> Vec<String> {
        self.config.config.exposed_ports.iter().cloned().collect()
    }

    pub fn set_port(&mut self, port: &str) {
        self.config.config.exposed_ports.insert(port.to_string());
    }

    pub fn remove_port(&mut self, port: &str) {
        self.config.config.exposed_ports.remove(port);
    }

    pub fn clear_ports(&mut self) {
        self.config.config.exposed_ports.clear();
    }

    pub fn volumes(&self) -> Vec<String> {
        self.config.config.volumes.iter().cloned().collect()
    }

    pub fn check_volume(&self, volume: &str) -> bool {
        self.config.config.volumes.contains(volume)
    }

    pub fn add_volume(&mut self, volume: &str) {
        self.config.config.volumes.insert(volume.to_string());
    }

    pub fn remove_volume(&mut self, volume: &str) {
        self.config.config.volumes.remove(volume);
    }

    pub fn clear_volumes(&mut self) {
        self.config.config.volumes.clear();
    }

    pub fn stop_signal(&self) -> &str {
        &self.config.config.stop_signal
    }

    pub fn set_stop_signal(&mut self, signal: &str) {
        self.config.config.stop_signal = signal.to_string();
    }

    pub fn healthcheck(&self) -> Option<&HealthConfig> {
        self.config.config.healthcheck.as_ref()
    }

    /// Docker format only
    pub fn set_healthcheck(&mut self, healthcheck: Option<HealthConfig>) {
        if healthcheck.is_some() {
            self.warn_docker_only("HEALTHCHECK", "set");
        }
        self.config.config.healthcheck = healthcheck;
    }

    pub fn hostname(&self) -> &str {
        &self.config.config.hostname
    }

    /// Docker format only
    pub fn set_hostname(&mut self, name: &str) {
        self.config.config.hostname = name.to_string();
    }

    /// Docker format only
    pub fn set_domainname(&mut self, name: &str) {
        self.warn_docker_only("DOMAINNAME", name);
        self.config.config.domainname = name.to_string();
    }

    pub fn on_build(&self) -> &[String] {
        &self.config.config.on_build
    }

    /// Docker format only
    pub fn set_onbuild(&mut self, trigger: &str) {
        self.warn_docker_only("ONBUILD", trigger);
        self.config.config.on_build.push(trigger.to_string());
    }

    pub fn clear_onbuild(&mut self) {
        self.config.config.on_build.clear();
    }

    // ---- pending layers ----

    pub fn add_prepended_empty_layer(
        &mut self,
        created: Option<DateTime<Utc>>,
        created_by: &str,
        author: &str,
        comment: &str,
    ) {
        self.prepended_empty_layers
            .push(empty_history(created, created_by, author, comment));
    }

    pub fn clear_prepended_empty_layers(&mut self) {
        self.prepended_empty_layers.clear();
    }

    pub fn add_appended_empty_layer(
        &mut self,
        created: Option<DateTime<Utc>>,
        created_by: &str,
        author: &str,
        comment: &str,
    ) {
        self.appended_empty_layers
            .push(empty_history(created, created_by, author, comment));
    }

    pub fn clear_appended_empty_layers(&mut self) {
        self.appended_empty_layers.clear();
    }

    pub fn add_prepended_linked_layer(
        &mut self,
        created: Option<DateTime<Utc>>,
        created_by: &str,
        author: &str,
        comment: &str,
        blob_path: Option<std::path::PathBuf>,
    ) {
        self.prepended_linked_layers
            .push(LinkedLayer::new(created, created_by, author, comment, blob_path));
    }

    pub fn clear_prepended_linked_layers(&mut self) {
        self.prepended_linked_layers.clear();
    }

    pub fn add_appended_linked_layer(
        &mut self,
        created: Option<DateTime<Utc>>,
        created_by: &str,
        author: &str,
        comment: &str,
        blob_path: Option<std::path::PathBuf>,
    ) {
        self.appended_linked_layers
            .push(LinkedLayer::new(created, created_by, author, comment, blob_path));
    }

    pub fn clear_appended_linked_layers(&mut self) {
        self.appended_linked_layers.clear();
    }
}

fn empty_history(
    created: Option<DateTime<Utc>>,
    created_by: &str,
    author: &str,
    comment: &str,
) -> History {
    History {
        created,
        created_by: created_by.to_string(),
        author: author.to_string(),
        comment: comment.to_string(),
        empty_layer: true,
    }
}

#[cfg(test)]
mod tests {
    use super::super::{BuilderOptions, Builder};
    use crate::store::Store;
    use tempfile::TempDir;

    fn builder(dir: &TempDir) -> (Store, Builder) {
        let store = Store::new(&dir.path().join("root"), &dir.path().join("run")).unwrap();
        let builder = Builder::new(&store, BuilderOptions::default()).unwrap();
        (store, builder)
    }

    #[test]
    fn test_env_replaces_existing_key() {
        let dir = TempDir::new().unwrap();
        let (_store, mut b) = builder(&dir);
        b.set_env("PATH", "/bin");
        b.set_env("HOME", "/root");
        b.set_env("PATH", "/usr/bin:/bin");
        assert_eq!(b.env(), &["HOME=/root".to_string(), "PATH=/usr/bin:/bin".to_string()]);
        b.unset_env("HOME");
        assert_eq!(b.env().len(), 1);
        b.clear_env();
        assert!(b.env().is_empty());
    }

    #[test]
    fn test_config_surface_is_rendered_both_ways() {
        let dir = TempDir::new().unwrap();
        let (_store, mut b) = builder(&dir);
        b.set_label("maintainer", "team");
        b.set_port("8080/tcp");
        b.add_volume("/data");
        b.set_entrypoint(Some(vec!["/init".to_string()]));
        b.set_cmd(Some(vec!["serve".to_string()]));
        b.set_user("app");
        b.set_workdir("/srv");
        b.set_stop_signal("SIGTERM");
        b.set_shell(&["/bin/bash".to_string(), "-c".to_string()]);

        let oci = serde_json::to_string(&b.config.to_oci().unwrap()).unwrap();
        assert!(oci.contains("8080/tcp"));
        assert!(oci.contains("/srv"));
        assert!(!oci.contains("/bin/bash"));

        let docker = b.config.to_docker().config.unwrap();
        assert_eq!(docker.user, "app");
        assert_eq!(docker.shell, Some(vec!["/bin/bash".to_string(), "-c".to_string()]));
        assert!(docker.volumes.unwrap().contains_key("/data"));

        b.remove_port("8080/tcp");
        b.remove_volume("/data");
        b.unset_label("maintainer");
        assert!(b.ports().is_empty());
        assert!(!b.check_volume("/data"));
        assert!(b.labels().is_empty());
    }

    #[test]
    fn test_pending_layers() {
        let dir = TempDir::new().unwrap();
        let (store, mut b) = builder(&dir);
        b.add_prepended_empty_layer(None, "ARG x", "", "");
        b.add_appended_empty_layer(None, "ENV y=1", "", "");
        b.add_appended_linked_layer(None, "COPY --link", "", "", Some(dir.path().join("blob")));
        b.add_appended_linked_layer(None, "nop", "", "", None);
        assert!(b.appended_linked_layers[1].history().empty_layer);
        b.save(&store).unwrap();

        let reopened = Builder::open(&store, &b.container_id).unwrap();
        assert_eq!(reopened.prepended_empty_layers.len(), 1);
        assert_eq!(reopened.appended_linked_layers.len(), 2);
        assert_eq!(reopened.history().len(), 2);

        b.clear_appended_linked_layers();
        b.clear_prepended_empty_layers();
        assert!(b.appended_linked_layers.is_empty());
    }

    #[test]
    fn test_annotations_and_platform() {
        let dir = TempDir::new().unwrap();
        let (_store, mut b) = builder(&dir);
        b.set_annotation("a", "1");
        assert_eq!(b.annotations().get("a").map(String::as_str), Some("1"));
        b.unset_annotation("a");
        assert!(b.annotations().get("a").is_none());
        b.set_architecture("aarch64");
        assert_eq!(b.architecture(), "arm64");
        b.set_os_feature("win32k");
        b.set_os_feature("win32k");
        assert_eq!(b.config.os_features.len(), 1);
        b.unset_os_feature("win32k");
        assert!(b.config.os_features.is_empty());
    }
}
