//! Name resolution files for RUN containers.
//!
//! Generates /etc/resolv.conf, /etc/hosts and /etc/hostname content from
//! configured DNS settings, the image's own files, or the host.

/// Default DNS servers (Google Public DNS).
const DEFAULT_DNS: &[&str] = &["8.8.8.8", "8.8.4.4"];

/// Generate resolv.conf content.
///
/// Resolution order:
/// 1. If `servers` is non-empty, use those servers
/// 2. Otherwise, copy the nameservers from `host_resolv` (the host's file)
/// 3. Fall back to Google Public DNS (8.8.8.8, 8.8.4.4)
///
/// `search` and `options` are appended as single lines when present.
pub fn generate_resolv_conf(
    servers: &[String],
    search: &[String],
    options: &[String],
    host_resolv: Option<&str>,
) -> String {
    let mut lines: Vec<String> = if !servers.is_empty() {
        servers.iter().map(|s| format!("nameserver {s}")).collect()
    } else {
        let from_host: Vec<String> = host_resolv
            .map(|content| {
                content
                    .lines()
                    .filter(|line| line.trim_start().starts_with("nameserver"))
                    .filter(|line| !is_loopback_nameserver(line))
                    .map(|line| line.trim().to_string())
                    .collect()
            })
            .unwrap_or_default();
        if from_host.is_empty() {
            DEFAULT_DNS.iter().map(|s| format!("nameserver {s}")).collect()
        } else {
            from_host
        }
    };

    if !search.is_empty() {
        lines.push(format!("search {}", search.join(" ")));
    }
    if !options.is_empty() {
        lines.push(format!("options {}", options.join(" ")));
    }
    lines.join("\n") + "\n"
}

/// Loopback resolvers (systemd-resolved, dnsmasq) are unreachable from a
/// private network namespace.
fn is_loopback_nameserver(line: &str) -> bool {
    line.split_whitespace()
        .nth(1)
        .map(|addr| addr.starts_with("127.") || addr == "::1")
        .unwrap_or(false)
}

/// Generate /etc/hosts content.
///
/// Starts from the image's hosts file (if any), adds the loopback entries
/// when missing, then `extra` `(name, ip)` pairs and finally the container
/// hostname bound to loopback.
pub fn generate_hosts_file(
    base: Option<&str>,
    hostname: &str,
    extra: &[(String, String)],
) -> String {
    let mut lines: Vec<String> = base
        .map(|b| b.lines().map(|l| l.to_string()).collect())
        .unwrap_or_default();
    let has_entry = |lines: &[String], name: &str| {
        lines.iter().any(|l| {
            !l.trim_start().starts_with('#') && l.split_whitespace().skip(1).any(|n| n == name)
        })
    };
    if !has_entry(&lines, "localhost") {
        lines.push("127.0.0.1 localhost localhost.localdomain".to_string());
        lines.push("::1 localhost localhost.localdomain".to_string());
    }
    for (name, ip) in extra {
        lines.push(format!("{} {}", ip, name));
    }
    if !hostname.is_empty() && !has_entry(&lines, hostname) {
        lines.push(format!("127.0.1.1 {}", hostname));
    }
    lines.join("\n") + "\n"
}

/// Generate /etc/hostname content.
pub fn generate_hostname_file(hostname: &str) -> String {
    format!("{}\n", hostname)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_dns() {
        let result = generate_resolv_conf(
            &["1.1.1.1".to_string(), "1.0.0.1".to_string()],
            &[],
            &[],
            None,
        );
        assert_eq!(result, "nameserver 1.1.1.1\nnameserver 1.0.0.1\n");
    }

    #[test]
    fn test_host_nameservers_skip_loopback() {
        let host = "# comment\nnameserver 127.0.0.53\nnameserver 10.0.0.1\nsearch lan\n";
        let result = generate_resolv_conf(&[], &[], &[], Some(host));
        assert_eq!(result, "nameserver 10.0.0.1\n");
    }

    #[test]
    fn test_fallback_dns() {
        let result = generate_resolv_conf(&[], &[], &[], Some("nameserver 127.0.0.1\n"));
        assert_eq!(result, "nameserver 8.8.8.8\nnameserver 8.8.4.4\n");
    }

    #[test]
    fn test_search_and_options() {
        let result = generate_resolv_conf(
            &["9.9.9.9".to_string()],
            &["a.example".to_string(), "b.example".to_string()],
            &["ndots:2".to_string()],
            None,
        );
        assert_eq!(
            result,
            "nameserver 9.9.9.9\nsearch a.example b.example\noptions ndots:2\n"
        );
    }

    #[test]
    fn test_hosts_file_from_scratch() {
        let result = generate_hosts_file(None, "builder", &[]);
        assert_eq!(
            result,
            "127.0.0.1 localhost localhost.localdomain\n::1 localhost localhost.localdomain\n127.0.1.1 builder\n"
        );
    }

    #[test]
    fn test_hosts_file_keeps_base_and_adds_extra() {
        let base = "127.0.0.1 localhost\n10.1.1.1 registry\n";
        let extra = vec![("db".to_string(), "10.88.0.4".to_string())];
        let result = generate_hosts_file(Some(base), "registry", &extra);
        assert_eq!(
            result,
            "127.0.0.1 localhost\n10.1.1.1 registry\n10.88.0.4 db\n"
        );
    }

    #[test]
    fn test_hostname_file() {
        assert_eq!(generate_hostname_file("abc"), "abc\n");
    }
}
