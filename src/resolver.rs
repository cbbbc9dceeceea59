//! System resolver configuration.
//!
//! Reads `/etc/resolv.conf` with the glibc/BSD option set. Reading never
//! fails: an unreadable file yields the loopback defaults, mirroring
//! what stub resolvers do.

use std::io::BufRead;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Standard limit on configured nameservers.
const MAX_NAMESERVERS: usize = 3;

/// Cap for numeric option values.
const BIG: u32 = 0x00ff_ffff;

/// Parsed resolver configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Nameserver endpoints as `host:port`, port 53.
    pub servers: Vec<String>,
    /// Rooted search suffixes.
    pub search: Vec<String>,
    pub ndots: u32,
    pub timeout: Duration,
    pub attempts: u32,
    pub rotate: bool,
    pub single_request: bool,
    pub use_tcp: bool,
    pub trust_ad: bool,
    pub no_reload: bool,
    /// An unrecognized option or keyword was seen (parsing continued).
    pub unknown_opt: bool,
    /// OpenBSD `lookup` keyword values.
    pub lookup: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            search: Vec::new(),
            ndots: 1,
            timeout: Duration::from_secs(5),
            attempts: 2,
            rotate: false,
            single_request: false,
            use_tcp: false,
            trust_ad: false,
            no_reload: false,
            unknown_opt: false,
            lookup: Vec::new(),
        }
    }
}

/// Read the system resolver configuration.
pub fn read_system_config() -> ResolverConfig {
    read_config(Path::new("/etc/resolv.conf"))
}

/// Read a resolv.conf-style file; failures fall back to defaults.
pub fn read_config(path: &Path) -> ResolverConfig {
    match std::fs::File::open(path) {
        Ok(file) => parse(std::io::BufReader::new(file)),
        Err(_) => {
            let mut conf = ResolverConfig::default();
            conf.servers = default_nameservers();
            conf.search = default_search();
            conf
        }
    }
}

/// Parse resolv.conf content.
pub fn parse(reader: impl BufRead) -> ResolverConfig {
    let mut conf = ResolverConfig::default();

    for line in reader.lines() {
        let Ok(line) = line else { break };
        if line.starts_with(';') || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(&keyword) = fields.first() else {
            continue;
        };

        match keyword {
            "nameserver" => {
                if let Some(server) = fields.get(1) {
                    if conf.servers.len() < MAX_NAMESERVERS {
                        // IP literals only; a name here would itself
                        // need resolving.
                        if let Ok(ip) = server.parse::<IpAddr>() {
                            conf.servers.push(join_host_port(ip, 53));
                        }
                    }
                }
            }

            "domain" => {
                if let Some(domain) = fields.get(1) {
                    conf.search = vec![ensure_rooted(domain)];
                }
            }

            "search" => {
                conf.search = fields[1..]
                    .iter()
                    .map(|name| ensure_rooted(name))
                    .filter(|name| name != ".")
                    .collect();
            }

            "options" => {
                for option in &fields[1..] {
                    parse_option(option, &mut conf);
                }
            }

            "lookup" => {
                conf.lookup = fields[1..].iter().map(|s| s.to_string()).collect();
            }

            _ => {
                conf.unknown_opt = true;
            }
        }
    }

    if conf.servers.is_empty() {
        conf.servers = default_nameservers();
    }
    if conf.search.is_empty() {
        conf.search = default_search();
    }

    conf
}

fn parse_option(option: &str, conf: &mut ResolverConfig) {
    if let Some(value) = option.strip_prefix("ndots:") {
        conf.ndots = dtoi(value).min(15);
    } else if let Some(value) = option.strip_prefix("timeout:") {
        conf.timeout = Duration::from_secs(dtoi(value).max(1) as u64);
    } else if let Some(value) = option.strip_prefix("attempts:") {
        conf.attempts = dtoi(value).max(1);
    } else {
        match option {
            "rotate" => conf.rotate = true,
            "single-request" | "single-request-reopen" => conf.single_request = true,
            "use-vc" | "usevc" | "tcp" => conf.use_tcp = true,
            "trust-ad" => conf.trust_ad = true,
            "no-reload" => conf.no_reload = true,
            // EDNS is on by default; the flag is a no-op.
            "edns0" => {}
            _ => conf.unknown_opt = true,
        }
    }
}

/// Loopback fallback nameservers.
fn default_nameservers() -> Vec<String> {
    vec!["127.0.0.1:53".to_string(), "[::1]:53".to_string()]
}

/// Single-suffix search list derived from the hostname's domain part.
fn default_search() -> Vec<String> {
    let Ok(hostname) = std::fs::read_to_string("/proc/sys/kernel/hostname") else {
        return Vec::new();
    };
    let hostname = hostname.trim();

    match hostname.find('.') {
        Some(i) if i + 1 < hostname.len() => vec![ensure_rooted(&hostname[i + 1..])],
        _ => Vec::new(),
    }
}

fn ensure_rooted(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    }
}

fn join_host_port(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{}:{}", v4, port),
        IpAddr::V6(v6) => format!("[{}]:{}", v6, port),
    }
}

/// Leading-decimal parse: the value of the longest digit prefix, capped.
/// A non-numeric prefix yields zero, which the callers clamp.
fn dtoi(s: &str) -> u32 {
    let mut n: u32 = 0;
    for c in s.chars() {
        let Some(digit) = c.to_digit(10) else { break };
        n = n * 10 + digit;
        if n >= BIG {
            return BIG;
        }
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse_str(s: &str) -> ResolverConfig {
        parse(Cursor::new(s))
    }

    #[test]
    fn test_basic_config() {
        let conf = parse_str(
            "# generated by resolvconf\n\
             nameserver 8.8.8.8\n\
             nameserver 1.1.1.1\n\
             search example.com lab.example.com\n",
        );

        assert_eq!(conf.servers, vec!["8.8.8.8:53", "1.1.1.1:53"]);
        assert_eq!(conf.search, vec!["example.com.", "lab.example.com."]);
        assert_eq!(conf.ndots, 1);
        assert_eq!(conf.timeout, Duration::from_secs(5));
        assert_eq!(conf.attempts, 2);
    }

    #[test]
    fn test_nameserver_limit_and_literal_only() {
        let conf = parse_str(
            "nameserver 10.0.0.1\n\
             nameserver 10.0.0.2\n\
             nameserver ns.example.com\n\
             nameserver 10.0.0.3\n\
             nameserver 10.0.0.4\n",
        );

        // The hostname is skipped; the cap is three.
        assert_eq!(conf.servers, vec!["10.0.0.1:53", "10.0.0.2:53", "10.0.0.3:53"]);
    }

    #[test]
    fn test_ipv6_nameserver_bracketed() {
        let conf = parse_str("nameserver fd00::53\n");
        assert_eq!(conf.servers, vec!["[fd00::53]:53"]);
    }

    #[test]
    fn test_domain_overrides_search() {
        let conf = parse_str("search a.example b.example\ndomain c.example\n");
        assert_eq!(conf.search, vec!["c.example."]);
    }

    #[test]
    fn test_options() {
        let conf = parse_str(
            "nameserver 10.0.0.1\n\
             options ndots:7 timeout:11 attempts:4 rotate single-request use-vc trust-ad no-reload edns0\n",
        );

        assert_eq!(conf.ndots, 7);
        assert_eq!(conf.timeout, Duration::from_secs(11));
        assert_eq!(conf.attempts, 4);
        assert!(conf.rotate);
        assert!(conf.single_request);
        assert!(conf.use_tcp);
        assert!(conf.trust_ad);
        assert!(conf.no_reload);
        assert!(!conf.unknown_opt);
    }

    #[test]
    fn test_option_clamps() {
        let conf = parse_str("options ndots:99 timeout:0 attempts:0\n");
        assert_eq!(conf.ndots, 15);
        assert_eq!(conf.timeout, Duration::from_secs(1));
        assert_eq!(conf.attempts, 1);
    }

    #[test]
    fn test_unknown_option_flags_but_parses() {
        let conf = parse_str(
            "nameserver 10.0.0.1\n\
             options ndots:2 no-such-option\n",
        );

        assert!(conf.unknown_opt);
        assert_eq!(conf.ndots, 2);
        assert_eq!(conf.servers, vec!["10.0.0.1:53"]);
    }

    #[test]
    fn test_unknown_keyword_flags() {
        let conf = parse_str("sortlist 10.0.0.0/8\n");
        assert!(conf.unknown_opt);
    }

    #[test]
    fn test_lookup_keyword() {
        let conf = parse_str("lookup file bind\n");
        assert_eq!(conf.lookup, vec!["file", "bind"]);
    }

    #[test]
    fn test_comments_and_blank_lines() {
        let conf = parse_str(
            "; comment\n\
             # another\n\
             \n\
             nameserver 10.0.0.1\n",
        );
        assert_eq!(conf.servers, vec!["10.0.0.1:53"]);
        assert!(!conf.unknown_opt);
    }

    #[test]
    fn test_empty_config_gets_default_servers() {
        let conf = parse_str("");
        assert_eq!(conf.servers, vec!["127.0.0.1:53", "[::1]:53"]);
    }

    #[test]
    fn test_missing_file_gets_defaults() {
        let conf = read_config(Path::new("/nonexistent/resolv.conf"));
        assert_eq!(conf.servers, vec!["127.0.0.1:53", "[::1]:53"]);
        assert_eq!(conf.ndots, 1);
    }

    #[test]
    fn test_search_drops_bare_root() {
        let conf = parse_str("nameserver 10.0.0.1\nsearch . example.com\n");
        assert_eq!(conf.search, vec!["example.com."]);
    }

    #[test]
    fn test_dtoi() {
        assert_eq!(dtoi("15"), 15);
        assert_eq!(dtoi("15abc"), 15);
        assert_eq!(dtoi("abc"), 0);
        assert_eq!(dtoi("99999999"), BIG);
    }
}
