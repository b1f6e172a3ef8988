//! Dockerfile-style configuration overrides applied at commit time.
//!
//! Accepts the instructions that only touch image configuration:
//! `CMD`, `ENTRYPOINT`, `ENV`, `EXPOSE`, `LABEL`, `ONBUILD`, `STOPSIGNAL`,
//! `USER`, `VOLUME` and `WORKDIR`.

use a3s_build_core::error::{BuildError, Result};

use super::ImageConfig;

/// Apply each change in order.
pub fn apply_changes(config: &mut ImageConfig, changes: &[String]) -> Result<()> {
    for change in changes {
        apply_change(config, change)?;
    }
    Ok(())
}

fn apply_change(config: &mut ImageConfig, change: &str) -> Result<()> {
    let change = change.trim();
    let (instruction, rest) = match change.split_once(char::is_whitespace) {
        Some((i, r)) => (i, r.trim()),
        None => (change, ""),
    };
    let invalid = |why: &str| {
        BuildError::InvalidArgument(format!("invalid change {:?}: {}", change, why))
    };
    let c = &mut config.config;
    match instruction.to_ascii_uppercase().as_str() {
        "CMD" => c.cmd = Some(command_form(rest)),
        "ENTRYPOINT" => {
            c.entrypoint = if rest.is_empty() {
                None
            } else {
                Some(command_form(rest))
            }
        }
        "ENV" => {
            for (key, value) in key_values(rest, true).map_err(|e| invalid(&e))? {
                c.env.retain(|e| e.split_once('=').map(|(k, _)| k) != Some(key.as_str()));
                c.env.push(format!("{}={}", key, value));
            }
        }
        "LABEL" => {
            for (key, value) in key_values(rest, false).map_err(|e| invalid(&e))? {
                c.labels.insert(key, value);
            }
        }
        "EXPOSE" => {
            if rest.is_empty() {
                return Err(invalid("no ports given"));
            }
            for port in rest.split_whitespace() {
                let port = if port.contains('/') {
                    port.to_string()
                } else {
                    format!("{}/tcp", port)
                };
                c.exposed_ports.insert(port);
            }
        }
        "VOLUME" => {
            let volumes = if rest.starts_with('[') {
                serde_json::from_str::<Vec<String>>(rest)
                    .map_err(|e| invalid(&e.to_string()))?
            } else {
                rest.split_whitespace().map(str::to_string).collect()
            };
            if volumes.is_empty() {
                return Err(invalid("no volumes given"));
            }
            c.volumes.extend(volumes);
        }
        "USER" => c.user = rest.to_string(),
        "WORKDIR" => {
            c.working_dir = if rest.starts_with('/') || c.working_dir.is_empty() {
                rest.to_string()
            } else {
                format!("{}/{}", c.working_dir.trim_end_matches('/'), rest)
            }
        }
        "STOPSIGNAL" => c.stop_signal = rest.to_string(),
        "ONBUILD" => {
            if rest.is_empty() {
                return Err(invalid("no trigger given"));
            }
            c.on_build.push(rest.to_string());
        }
        other => {
            return Err(BuildError::InvalidArgument(format!(
                "{} is not a valid change instruction",
                other
            )))
        }
    }
    Ok(())
}

/// Exec form when given a JSON array, otherwise shell form.
fn command_form(rest: &str) -> Vec<String> {
    if rest.starts_with('[') {
        if let Ok(args) = serde_json::from_str::<Vec<String>>(rest) {
            return args;
        }
    }
    vec!["/bin/sh".to_string(), "-c".to_string(), rest.to_string()]
}

/// `k=v k2="v 2"` pairs, or the legacy single `KEY value` form when
/// `legacy` is allowed and the first word has no `=`.
fn key_values(rest: &str, legacy: bool) -> std::result::Result<Vec<(String, String)>, String> {
    let words = split_words(rest)?;
    if words.is_empty() {
        return Err("no key=value pairs given".to_string());
    }
    if !words[0].contains('=') {
        if legacy && words.len() >= 2 {
            let value = rest[rest.find(char::is_whitespace).unwrap_or(rest.len())..].trim();
            return Ok(vec![(words[0].clone(), unquote(value))]);
        }
        return Err(format!("{:?} is not a key=value pair", words[0]));
    }
    words
        .iter()
        .map(|w| match w.split_once('=') {
            Some((k, v)) if !k.is_empty() => Ok((k.to_string(), unquote(v))),
            _ => Err(format!("{:?} is not a key=value pair", w)),
        })
        .collect()
}

/// Split on whitespace, keeping quoted runs together.
fn split_words(s: &str) -> std::result::Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for ch in s.chars() {
        match quote {
            Some(q) if ch == q => {
                quote = None;
                current.push(ch);
            }
            Some(_) => current.push(ch),
            None if ch == '"' || ch == '\'' => {
                quote = Some(ch);
                current.push(ch);
            }
            None if ch.is_whitespace() => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            None => current.push(ch),
        }
    }
    if quote.is_some() {
        return Err("unterminated quote".to_string());
    }
    if !current.is_empty() {
        words.push(current);
    }
    Ok(words)
}

fn unquote(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'"' || bytes[0] == b'\'')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(changes: &[&str]) -> ImageConfig {
        let mut config = ImageConfig::default();
        let changes: Vec<String> = changes.iter().map(|s| s.to_string()).collect();
        apply_changes(&mut config, &changes).unwrap();
        config
    }

    #[test]
    fn test_cmd_forms() {
        let config = apply(&[r#"CMD ["nginx", "-g", "daemon off;"]"#]);
        assert_eq!(
            config.config.cmd,
            Some(vec!["nginx".to_string(), "-g".to_string(), "daemon off;".to_string()])
        );
        let config = apply(&["ENTRYPOINT exec server"]);
        assert_eq!(
            config.config.entrypoint,
            Some(vec!["/bin/sh".to_string(), "-c".to_string(), "exec server".to_string()])
        );
    }

    #[test]
    fn test_env_and_label() {
        let config = apply(&[
            "ENV A=1 B=\"two words\"",
            "ENV A=3",
            "ENV LEGACY some value",
            "LABEL org.example.name=\"demo app\" tier=web",
        ]);
        assert_eq!(
            config.config.env,
            vec!["B=two words".to_string(), "A=3".to_string(), "LEGACY=some value".to_string()]
        );
        assert_eq!(config.config.labels["org.example.name"], "demo app");
        assert_eq!(config.config.labels["tier"], "web");
    }

    #[test]
    fn test_expose_volume_workdir() {
        let config = apply(&[
            "EXPOSE 80 53/udp",
            r#"VOLUME ["/data", "/logs"]"#,
            "WORKDIR /srv",
            "WORKDIR app",
            "USER nobody",
            "STOPSIGNAL SIGQUIT",
            "ONBUILD RUN make",
        ]);
        assert!(config.config.exposed_ports.contains("80/tcp"));
        assert!(config.config.exposed_ports.contains("53/udp"));
        assert!(config.config.volumes.contains("/logs"));
        assert_eq!(config.config.working_dir, "/srv/app");
        assert_eq!(config.config.user, "nobody");
        assert_eq!(config.config.stop_signal, "SIGQUIT");
        assert_eq!(config.config.on_build, vec!["RUN make".to_string()]);
    }

    #[test]
    fn test_rejects_other_instructions() {
        let mut config = ImageConfig::default();
        assert!(apply_changes(&mut config, &["RUN make".to_string()]).is_err());
        assert!(apply_changes(&mut config, &["LABEL novalue".to_string()]).is_err());
        assert!(apply_changes(&mut config, &["EXPOSE".to_string()]).is_err());
    }
}
