// tpop3d: a concurrent POP3 (RFC 1939) server. `run` assembles everything a
// configuration file describes - listeners, TLS, the authentication switch
// and its cache, mailbox discovery templates, locking policy - and drives
// the reactor until a terminating signal arrives, reloading on SIGHUP the
// way the original re-read its configuration rather than treating it as
// fixed at startup.

pub mod auth;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod lastlogin;
pub mod listener;
pub mod mailbox;
pub mod pidfile;
pub mod pop3;
pub mod reactor;
pub mod signals;
pub mod substvars;
pub mod transport;

use anyhow::Context as _;
use std::{
  fs, io, net, path,
  os::unix::io::AsRawFd as _,
  sync::{atomic::Ordering, Arc},
  time,
};

pub struct Arguments {
  pub config_path: path::PathBuf,
  /// `-d`: stay attached to the controlling terminal and log to stderr too.
  pub foreground: bool,
  /// `-P`: prompt on the controlling terminal for TLS private key pass phrases.
  pub prompt_passphrase: bool,
  pub verbosity: log::LevelFilter,
}

pub fn run(arguments: &Arguments) -> anyhow::Result<()> {
  if !arguments.foreground {
    daemonize().context("daemonizing")?;
  }

  let mut config = config::Config::load(&arguments.config_path)
    .with_context(|| format!("loading {:?}", arguments.config_path))?;
  init_logging(&config, arguments)?;

  if let Some(name) = config.get("tcp-wrappers-name") {
    log::info!("tcp-wrappers-name {name:?} configured; enforcement uses allow-hosts/deny-hosts only");
  }
  if let Some(facility) = config.get("log-facility") {
    log::info!("log-facility {facility:?} configured; informational only, logging stays via log4rs");
  }

  let mut pidfile_path = None;
  if let Some(raw) = config.get("pidfile") {
    let path = path::PathBuf::from(raw);
    pidfile::write(&path).with_context(|| format!("writing pidfile {path:?}"))?;
    pidfile_path = Some(path);
  }

  let mut privileges_dropped = false;
  let result = (|| -> anyhow::Result<()> {
    loop {
      let reactor = build_reactor(&config, arguments.prompt_passphrase)?;
      if !privileges_dropped {
        // Listeners (including any privileged port below 1024) are already
        // bound by now; give up root for good before accepting a single
        // connection. Per-session privilege separation in the reactor's
        // fork-and-setuid path still applies on top of whatever this drops
        // to.
        drop_initial_privileges(&config).context("dropping initial privileges")?;
        privileges_dropped = true;
      }
      let restart = reactor.run()?;
      if !restart {
        return Ok(());
      }
      signals::TERMINATE.store(false, Ordering::Relaxed);
      signals::RESTART.store(false, Ordering::Relaxed);
      log::info!("reloading configuration after SIGHUP");
      config = config::Config::load(&arguments.config_path)
        .with_context(|| format!("reloading {:?}", arguments.config_path))?;
    }
  })();

  if let Some(path) = &pidfile_path {
    if let Err(error) = pidfile::remove(path) {
      log::warn!("removing pidfile {path:?}: {error}");
    }
  }
  result
}

/// Fork-detach from the controlling terminal. A classic double fork plus
/// `setsid`: the first fork backgrounds the process, `setsid` makes it a
/// session leader with no controlling terminal, and the second fork gives
/// up session-leader status so it can never reacquire one.
fn daemonize() -> anyhow::Result<()> {
  fork_and_exit_parent()?;
  if unsafe { libc::setsid() } == -1 {
    anyhow::bail!("setsid: {}", io::Error::last_os_error());
  }
  fork_and_exit_parent()?;
  let _ = std::env::set_current_dir("/");
  for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
    redirect_to_dev_null(fd)?;
  }
  Ok(())
}

fn fork_and_exit_parent() -> anyhow::Result<()> {
  match unsafe { libc::fork() } {
    -1 => anyhow::bail!("fork: {}", io::Error::last_os_error()),
    0 => Ok(()),
    _ => unsafe { libc::_exit(0) },
  }
}

/// Drop from root to the configured `user`/`group` once, at startup, after
/// any privileged port has already been bound. A no-op if neither
/// directive is set (the common case of running as an already-unprivileged
/// user throughout). `group` is applied before `user` so the process still
/// has permission to call `setgid` at the point it's needed.
fn drop_initial_privileges(config: &config::Config) -> anyhow::Result<()> {
  if unsafe { libc::getuid() } != 0 {
    if config.get("user").is_some() || config.get("group").is_some() {
      log::warn!("user/group configured but process is not running as root; ignoring");
    }
    return Ok(());
  }

  if let Some(name) = config.get("group") {
    let group = users::get_group_by_name(name).ok_or_else(|| anyhow::anyhow!("unknown group {name:?}"))?;
    if unsafe { libc::setgid(group.gid()) } == -1 {
      anyhow::bail!("setgid({}): {}", group.gid(), io::Error::last_os_error());
    }
  }
  if let Some(name) = config.get("user") {
    let account = users::get_user_by_name(name).ok_or_else(|| anyhow::anyhow!("unknown user {name:?}"))?;
    if unsafe { libc::setuid(account.uid()) } == -1 {
      anyhow::bail!("setuid({}): {}", account.uid(), io::Error::last_os_error());
    }
  }
  Ok(())
}

fn redirect_to_dev_null(fd: libc::c_int) -> anyhow::Result<()> {
  let devnull = fs::OpenOptions::new().read(true).write(true).open("/dev/null")?;
  if unsafe { libc::dup2(devnull.as_raw_fd(), fd) } == -1 {
    anyhow::bail!("dup2: {}", io::Error::last_os_error());
  }
  Ok(())
}

fn init_logging(config: &config::Config, arguments: &Arguments) -> anyhow::Result<()> {
  let encoder = Box::new(log4rs::encode::pattern::PatternEncoder::new("{d(%F %T)} {l} {t} - {m}{n}"));
  let log_path = path::PathBuf::from(config.get("log-file").unwrap_or("/var/log/tpop3d.log"));
  let file_appender = log4rs::append::file::FileAppender::builder()
    .encoder(encoder.clone())
    .build(&log_path)
    .with_context(|| format!("opening log file {log_path:?}"))?;

  let mut config_builder = log4rs::config::Config::builder().appender(
    log4rs::config::Appender::builder()
      .filter(Box::new(log4rs::filter::threshold::ThresholdFilter::new(log::LevelFilter::Trace)))
      .build("file", Box::new(file_appender)),
  );
  let mut root = log4rs::config::Root::builder().appender("file");

  if arguments.foreground {
    config_builder = config_builder.appender(
      log4rs::config::Appender::builder()
        .filter(Box::new(log4rs::filter::threshold::ThresholdFilter::new(arguments.verbosity)))
        .build(
          "console",
          Box::new(log4rs::append::console::ConsoleAppender::builder().encoder(encoder).build()),
        ),
    );
    root = root.appender("console");
  }

  log4rs::init_config(config_builder.build(root.build(log::LevelFilter::Trace))?)?;
  Ok(())
}

fn build_reactor(config: &config::Config, prompt_passphrase: bool) -> anyhow::Result<reactor::Reactor> {
  let max_children = config.get_u64("max-children", 100)? as usize;
  let limits = connection::Limits {
    idle_timeout: time::Duration::from_secs(config.get_u64("timeout-seconds", 30)?),
    max_protocol_errors: config.get_u64("max-protocol-errors", 8)? as u32,
    max_auth_attempts: config.get_u64("max-auth-attempts", 3)? as u32,
  };

  let discovery = reactor::DiscoveryTemplates {
    per_driver: build_mailbox_templates(config),
    global: config.get("mailbox").map(str::to_string),
    default_root: path::PathBuf::from(config.get("mailspool-dir").unwrap_or("/var/spool/mail")),
    locking: build_locking_config(config)?,
  };

  let reactor_config = reactor::Config {
    max_children,
    limits,
    discovery,
    lastlogin_enabled: config.get_bool("lastlogin-enable", false)?,
  };

  let switch = build_switch(config)?;
  let listeners = build_listeners(config, prompt_passphrase)?;
  let access_control = build_access_control(config)?;

  Ok(reactor::Reactor::new(listeners, switch, reactor_config, access_control))
}

/// Drivers tried in a fixed order; `auth-order` isn't separately
/// configurable here since spec.md doesn't name a reordering directive, but
/// every driver still only participates when its own `auth-<name>-enable`
/// says so.
const DRIVER_NAMES: [&str; 6] = ["passwd", "flatfile", "dbm", "sql", "ldap", "other"];

fn build_mailbox_templates(config: &config::Config) -> Vec<(String, String)> {
  DRIVER_NAMES
    .iter()
    .filter_map(|name| config.get(&format!("auth-{name}-mailbox")).map(|template| (name.to_string(), template.to_string())))
    .collect()
}

fn build_locking_config(config: &config::Config) -> anyhow::Result<mailbox::locks::Config> {
  let defaults = mailbox::locks::Config::default();
  Ok(mailbox::locks::Config {
    retries: config.get_u64("mailbox-lock-retries", defaults.retries as u64)? as u32,
    retry_sleep: time::Duration::from_millis(
      config.get_u64("mailbox-lock-retry-sleep-ms", defaults.retry_sleep.as_millis() as u64)?,
    ),
    use_fcntl: config.get_bool("mailbox-lock-fcntl", defaults.use_fcntl)?,
    use_flock: config.get_bool("mailbox-lock-flock", defaults.use_flock)?,
    use_dotlock: config.get_bool("mailbox-lock-dotfile", defaults.use_dotlock)?,
    cclient_steal: config.get_bool("mailbox-cclient-locking-enable", false)?,
  })
}

fn build_switch(config: &config::Config) -> anyhow::Result<auth::Switch> {
  let mut drivers: Vec<Box<dyn auth::Driver>> = Vec::new();

  if config.is_driver_enabled("passwd", false)? {
    drivers.push(Box::new(auth::passwd::Passwd::new(true)));
  }
  if config.is_driver_enabled("flatfile", false)? {
    let path = require(config, "auth-flatfile-path", "auth-flatfile-enable")?;
    drivers.push(Box::new(auth::flatfile::Flatfile::new(path::PathBuf::from(path), true)));
  }
  if config.is_driver_enabled("dbm", false)? {
    let path = require(config, "auth-dbm-path", "auth-dbm-enable")?;
    drivers.push(Box::new(auth::dbm::Dbm::open(path::Path::new(path), true)?));
  }
  if config.is_driver_enabled("sql", false)? {
    drivers.push(Box::new(build_sql_driver(config)?));
  }
  if config.is_driver_enabled("ldap", false)? {
    drivers.push(Box::new(build_ldap_driver(config)?));
  }
  if config.is_driver_enabled("other", false)? {
    let command = require(config, "auth-other-command", "auth-other-enable")?.to_string();
    let args = config
      .get("auth-other-args")
      .map(|value| value.split_whitespace().map(str::to_string).collect())
      .unwrap_or_default();
    // Default 0.75s per spec.md §5; §4.4 bounds the configured value to 0-10s.
    let timeout_seconds = config.get_f64("auth-other-timeout", 0.75)?.clamp(0.0, 10.0);
    let read_deadline = time::Duration::from_secs_f64(timeout_seconds);
    drivers.push(Box::new(auth::other::Other::new(command, args, true, read_deadline)));
  }

  let cache = if config.get_bool("authcache-enable", false)? {
    let lifetime = time::Duration::from_secs(config.get_u64("authcache-entry-lifetime", 3600)?);
    Some(auth::cache::Cache::new(lifetime))
  } else {
    None
  };

  Ok(auth::Switch::new(
    drivers,
    cache,
    config.get("append-domain").map(str::to_string),
    config.get_bool("authcache-use-client-host", true)?,
  ))
}

fn require<'a>(config: &'a config::Config, key: &str, gate: &str) -> anyhow::Result<&'a str> {
  config.get(key).with_context(|| format!("{gate} is set but {key} is missing"))
}

fn build_sql_driver(config: &config::Config) -> anyhow::Result<auth::sql::Sql> {
  let query = require(config, "auth-sql-user-pass-query", "auth-sql-enable")?.to_string();
  let dsn = require(config, "auth-sql-dsn", "auth-sql-enable")?.to_string();
  let backend = match config.get("auth-sql-backend") {
    Some("mysql") => auth::sql::Backend::Mysql { url: dsn },
    _ => auth::sql::Backend::Postgres { connection_string: dsn },
  };
  Ok(auth::sql::Sql::new(backend, query, true))
}

fn build_ldap_driver(config: &config::Config) -> anyhow::Result<auth::ldap::Ldap> {
  Ok(auth::ldap::Ldap::new(auth::ldap::Config {
    url: require(config, "auth-ldap-url", "auth-ldap-enable")?.to_string(),
    bind_dn: config.get("auth-ldap-bind-dn").unwrap_or("").to_string(),
    bind_password: config.get("auth-ldap-bind-password").unwrap_or("").to_string(),
    base_dn: require(config, "auth-ldap-base-dn", "auth-ldap-enable")?.to_string(),
    filter_template: config.get("auth-ldap-filter").unwrap_or("(uid=$(user))").to_string(),
    uid_attribute: config.get("auth-ldap-uid-attribute").unwrap_or("uidNumber").to_string(),
    home_attribute: config.get("auth-ldap-home-attribute").unwrap_or("homeDirectory").to_string(),
    enabled: true,
  }))
}

enum ListenTls {
  Plain,
  Implicit,
  Stls,
}

fn build_listeners(config: &config::Config, prompt_passphrase: bool) -> anyhow::Result<Vec<listener::Listener>> {
  let tls_config = build_tls_config(config, prompt_passphrase)?;
  let mut listeners = Vec::new();
  for spec in config.get_all("listen-address") {
    for token in spec.split_whitespace() {
      listeners.push(parse_listen_token(token, tls_config.as_ref())?);
    }
  }
  if listeners.is_empty() {
    anyhow::bail!("no listen-address configured");
  }
  Ok(listeners)
}

fn parse_listen_token(token: &str, tls_config: Option<&Arc<rustls::ServerConfig>>) -> anyhow::Result<listener::Listener> {
  let (address, mode) = match token.rsplit_once('/') {
    Some((address, "tls")) => (address, ListenTls::Implicit),
    Some((address, "stls")) => (address, ListenTls::Stls),
    _ => (token, ListenTls::Plain),
  };
  let tls_mode = match mode {
    ListenTls::Plain => listener::TlsMode::Plain,
    ListenTls::Implicit => listener::TlsMode::Implicit(
      tls_config.cloned().context("listen-address requests /tls but no tls-certificate/tls-key are configured")?,
    ),
    ListenTls::Stls => listener::TlsMode::Stls(
      tls_config.cloned().context("listen-address requests /stls but no tls-certificate/tls-key are configured")?,
    ),
  };
  listener::Listener::bind(address, None, tls_mode)
}

fn build_tls_config(config: &config::Config, prompt_passphrase: bool) -> anyhow::Result<Option<Arc<rustls::ServerConfig>>> {
  let (Some(cert_path), Some(key_path)) = (config.get("tls-certificate"), config.get("tls-key")) else {
    return Ok(None);
  };
  let certs = load_certs(path::Path::new(cert_path))?;
  let key = load_key(path::Path::new(key_path), prompt_passphrase)?;
  let server_config = rustls::ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .context("building TLS server configuration")?;
  Ok(Some(Arc::new(server_config)))
}

fn load_certs(path: &path::Path) -> anyhow::Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
  let file = fs::File::open(path).with_context(|| format!("opening {path:?}"))?;
  let mut reader = io::BufReader::new(file);
  rustls_pemfile::certs(&mut reader)
    .collect::<Result<Vec<_>, _>>()
    .with_context(|| format!("parsing certificates in {path:?}"))
}

fn load_key(path: &path::Path, prompt_passphrase: bool) -> anyhow::Result<rustls::pki_types::PrivateKeyDer<'static>> {
  let file = fs::File::open(path).with_context(|| format!("opening {path:?}"))?;
  let mut reader = io::BufReader::new(file);
  match rustls_pemfile::private_key(&mut reader).with_context(|| format!("parsing private key in {path:?}"))? {
    Some(key) => Ok(key),
    None if prompt_passphrase => {
      let _passphrase = rpassword::prompt_password(format!("pass phrase for {path:?}: "))
        .context("reading pass phrase")?;
      anyhow::bail!(
        "{path:?}: no unencrypted private key found; encrypted PEM keys aren't supported, supply an unencrypted key file"
      )
    }
    None => anyhow::bail!("{path:?}: no private key found (pass -P if it is passphrase-protected)"),
  }
}

fn build_access_control(config: &config::Config) -> anyhow::Result<reactor::AccessControl> {
  let allow = parse_ip_list(config.get("allow-hosts"))?;
  let deny = parse_ip_list(config.get("deny-hosts"))?;
  Ok(Box::new(move |ip: net::IpAddr| {
    if !allow.is_empty() && !allow.contains(&ip) {
      return false;
    }
    !deny.contains(&ip)
  }))
}

fn parse_ip_list(value: Option<&str>) -> anyhow::Result<Vec<net::IpAddr>> {
  let Some(value) = value else { return Ok(Vec::new()) };
  value
    .split(',')
    .map(str::trim)
    .filter(|entry| !entry.is_empty())
    .map(|entry| entry.parse().with_context(|| format!("{entry:?} is not an IP address")))
    .collect()
}
