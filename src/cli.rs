use crate::api::{Portal, PortalApi, Registration};
use crate::auth::AuthGateway;
use crate::config::Config;
use crate::guard::{describe_role, has_any_role, landing_view, Decision, Role, RouteGuard};
use crate::http::{Headers, Method, Response, UreqTransport};
use crate::session::{Session, SessionState, SystemClock};
use crate::storage::KeyValueStorage;
use crate::Command;
use anyhow::{anyhow, Result};
use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::cell::RefCell;

pub type Gateway = AuthGateway<Box<dyn KeyValueStorage>, UreqTransport, SystemClock>;

pub struct Context {
    pub config: Config,
    pub api: PortalApi,
    pub guard: RouteGuard,
    pub gateway: RefCell<Gateway>,
    pub ephemeral: bool,
    pub run_id: String,
}

/// A shell line parsed with the same subcommands as the binary
#[derive(Parser)]
#[command(name = "", no_binary_name = true)]
struct ShellLine {
    #[command(subcommand)]
    command: Command,
}

pub fn run_command(ctx: &Context, command: Command) -> Result<()> {
    match command {
        Command::Login {
            username,
            password,
            portal,
        } => login(ctx, &username, password, &portal),
        Command::Logout => {
            ctx.gateway.borrow_mut().logout()?;
            println!("Signed out");
            Ok(())
        }
        Command::Status => {
            print_status(ctx);
            Ok(())
        }
        Command::Get { path, headers } => send(ctx, Method::Get, &path, &headers, None),
        Command::Request {
            method,
            path,
            data,
            headers,
        } => {
            let method = Method::from_str(&method).ok_or_else(|| {
                anyhow!(
                    "Invalid method: {}. Use: GET, POST, PUT, PATCH, DELETE",
                    method
                )
            })?;
            send(ctx, method, &path, &headers, data)
        }
        Command::Open { view } => open_view(ctx, &view),
        Command::Views { role } => {
            let role = match role {
                Some(name) => Some(
                    Role::from_str(&name).ok_or_else(|| anyhow!("Unknown role: {}", name))?,
                ),
                None => None,
            };
            print_views(ctx, role);
            Ok(())
        }
        Command::Register {
            enrollment_number,
            email,
            full_name,
            password,
        } => {
            let registration = Registration {
                enrollment_number,
                email,
                full_name,
                password: password_or_prompt(password, true)?,
            };
            let message = ctx
                .api
                .register(&mut *ctx.gateway.borrow_mut(), &registration)?;
            println!("{}", message);
            Ok(())
        }
        Command::ForgotPassword { email } => {
            let outcome = ctx
                .api
                .forgot_password(&mut *ctx.gateway.borrow_mut(), &email)?;
            println!("{}", outcome.message);
            if let Some(token) = outcome.reset_token {
                println!("Reset token: {}", token);
                println!("Use: uniportal reset-password {}", token);
            }
            Ok(())
        }
        Command::ResetPassword { token, password } => {
            let password = password_or_prompt(password, true)?;
            let message = ctx
                .api
                .reset_password(&mut *ctx.gateway.borrow_mut(), &token, &password)?;
            println!("{}", message);
            println!("Sign in again with the new password.");
            Ok(())
        }
        Command::ChangePassword { password } => {
            let password = password_or_prompt(password, true)?;
            let message = ctx
                .api
                .change_password(&mut *ctx.gateway.borrow_mut(), &password)?;
            println!("{}", message);
            Ok(())
        }
        Command::Config => print_config(ctx),
        Command::Shell => Err(anyhow!("Already in the shell")),
    }
}

pub fn run_repl(ctx: Context) -> Result<()> {
    let mut rl = DefaultEditor::new()?;

    println!("uniportal - type help for commands, exit to quit");
    print_status(&ctx);

    loop {
        let prompt = match ctx.gateway.borrow().state() {
            SessionState::Authenticated => "uniportal* > ",
            SessionState::Anonymous => "uniportal > ",
        };
        match rl.readline(prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                rl.add_history_entry(line)?;

                if handle_line(&ctx, line) {
                    break;
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Input error: {}", e);
                break;
            }
        }
    }

    if ctx.ephemeral && ctx.gateway.borrow().session().token.is_some() {
        println!("Ephemeral session discarded");
    }
    Ok(())
}

/// Returns true when the shell should exit
fn handle_line(ctx: &Context, line: &str) -> bool {
    let words = match shell_words::split(line) {
        Ok(words) => words,
        Err(e) => {
            println!("Parse error: {}", e);
            return false;
        }
    };
    let Some(first) = words.first() else {
        return false;
    };

    // Accept both "status" and "/status"
    let name = first.trim_start_matches('/').to_string();
    match name.as_str() {
        "exit" | "quit" => return true,
        "help" => {
            print_shell_help();
            return false;
        }
        _ => {}
    }

    let args = std::iter::once(name).chain(words.into_iter().skip(1));
    match ShellLine::try_parse_from(args) {
        Ok(ShellLine {
            command: Command::Shell,
        }) => println!("Already in the shell"),
        Ok(parsed) => {
            if let Err(e) = run_command(ctx, parsed.command) {
                eprintln!("Error: {:#}", e);
            }
        }
        Err(e) => println!("{}", e),
    }
    false
}

fn print_shell_help() {
    println!("Commands:");
    println!("  exit                          - quit");
    println!("  help                          - show commands");
    println!("  status                        - show session info");
    println!("  login -u <user> [--portal p]  - sign in (student|institute|admin)");
    println!("  logout                        - sign out");
    println!("Requests:");
    println!("  get <path> [-H 'Name: v']     - authorized GET, e.g. get /admin/stats");
    println!("  request <METHOD> <path> [-d json] [-H 'Name: v']");
    println!("Views:");
    println!("  views [--role r]              - list portal views");
    println!("  open <view>                   - open a view, e.g. open /student/dashboard");
    println!("Account:");
    println!("  register --enrollment-number <n> --email <e> [--full-name <name>]");
    println!("  forgot-password <email>");
    println!("  reset-password <token>");
    println!("  change-password");
    println!("  config                        - show effective configuration");
}

fn login(ctx: &Context, username: &str, password: Option<String>, portal: &str) -> Result<()> {
    let portal = Portal::from_str(portal).ok_or_else(|| {
        anyhow!(
            "Invalid portal: {}. Use: student, institute, admin",
            portal
        )
    })?;
    let password = password_or_prompt(password, false)?;

    let outcome = ctx
        .api
        .login(&mut *ctx.gateway.borrow_mut(), portal, username, &password)?;

    println!(
        "Signed in to the {} portal as {}",
        portal.as_str(),
        describe_role(outcome.role_id)
    );
    if let Some(expires_at) = ctx.gateway.borrow().session().expires_at {
        println!("Session expires {}", format_timestamp(expires_at));
    }
    if outcome.force_password_change {
        println!("A password change is required: uniportal change-password");
    } else if let Some(landing) = outcome.landing {
        println!("Next: uniportal open {}", landing);
    }
    Ok(())
}

fn send(
    ctx: &Context,
    method: Method,
    path: &str,
    header_lines: &[String],
    body: Option<String>,
) -> Result<()> {
    let mut headers = Headers::new();
    for line in header_lines {
        let (name, value) = Headers::parse_line(line)?;
        headers.set(&name, &value);
    }

    let response = ctx
        .api
        .fetch(&mut *ctx.gateway.borrow_mut(), method, path, headers, body)?;
    print_response(ctx, &response)
}

fn open_view(ctx: &Context, path: &str) -> Result<()> {
    let decision = {
        let gateway = ctx.gateway.borrow();
        ctx.guard.check_view(path, gateway.session(), gateway.now())
    };

    {
        let mut gateway = ctx.gateway.borrow_mut();
        if let Some(journal) = gateway.journal_mut() {
            if let Err(e) = journal.guard_decision(path, decision.is_allowed()) {
                tracing::warn!(error = %e, "Failed to write journal");
            }
        }
    }

    match decision {
        Decision::Allow => {
            // Known view: check_view only allows entries from the table
            let view = RouteGuard::find_view(path)
                .ok_or_else(|| anyhow!("Unknown view: {}", path))?;
            println!("{}", view.title);
            send(ctx, Method::Get, view.resource, &[], None)
        }
        Decision::Redirect(target) => {
            match RouteGuard::find_view(path) {
                Some(view) => println!(
                    "{} requires {}; redirecting to {}",
                    view.path,
                    view.role.name(),
                    target
                ),
                None => println!("Unknown view {}; redirecting to {}", path, target),
            }
            println!("Sign in with: uniportal login -u <username>");
            Ok(())
        }
    }
}

fn print_views(ctx: &Context, role: Option<Role>) {
    let gateway = ctx.gateway.borrow();
    let (session, now) = (gateway.session(), gateway.now());
    println!("Views (* = open to this session):");
    for view in RouteGuard::views()
        .iter()
        .filter(|v| role.map_or(true, |r| v.role == r))
    {
        let marker = if ctx.guard.check(view.role, session, now).is_allowed() {
            " *"
        } else {
            ""
        };
        println!(
            "  {:<22} {:<18} {}{}",
            view.path,
            view.role.name(),
            view.title,
            marker
        );
    }
}

fn print_status(ctx: &Context) {
    let gateway = ctx.gateway.borrow();
    let now = gateway.now();
    let session: &Session = gateway.session();

    println!("API: {}", ctx.api.api_base());
    if ctx.ephemeral {
        println!("Session storage: memory");
    } else {
        println!("Session storage: {}", ctx.config.session_path().display());
    }

    match session.state(now) {
        SessionState::Anonymous => println!("Not signed in"),
        SessionState::Authenticated => {
            println!("Signed in as {}", describe_role(gateway.role_id()));
            match (session.expires_at, session.remaining_millis(now)) {
                (Some(exp), Some(remaining)) => println!(
                    "Expires {} (in {})",
                    format_timestamp(exp),
                    format_duration(remaining)
                ),
                _ => println!("No client-side expiry"),
            }
            if !has_any_role(session, now, &Role::ALL) {
                println!("No portal views available for this role");
            } else if let Some(landing) = landing_view(gateway.role_id(), false) {
                println!("Home view: {}", landing);
            }
        }
    }
    println!("Sign-in view: {}", ctx.guard.entry_point());
}

fn print_config(ctx: &Context) -> Result<()> {
    let cfg = &ctx.config;
    println!("# Layers merged from ~/.uniportal, .uniportal and overrides");
    print!("{}", toml::to_string_pretty(cfg)?);
    println!();
    println!("# Effective values");
    println!("api_base = {:?}", cfg.api_base());
    println!("http.timeout_ms = {}", cfg.timeout().as_millis());
    println!("session.path = {:?}", cfg.session_path().display().to_string());
    let keys = cfg.storage_keys();
    println!(
        "session.keys = [{:?}, {:?}, {:?}]",
        keys.token, keys.expiry, keys.role
    );
    println!("session.recheck_on_fetch = {}", cfg.recheck_on_fetch());
    match cfg.journal_path() {
        Some(path) => println!("journal.path = {:?}", path.display().to_string()),
        None => println!("journal.enabled = false"),
    }
    println!("guard.entry_point = {:?}", cfg.entry_point());
    println!("run_id = {:?}", ctx.run_id);
    Ok(())
}

fn print_response(ctx: &Context, response: &Response) -> Result<()> {
    let rendered = match serde_json::from_str::<serde_json::Value>(&response.body) {
        Ok(value) => serde_json::to_string_pretty(&value)?,
        Err(_) => response.body.clone(),
    };
    if !rendered.is_empty() {
        println!("{}", rendered);
    }

    if response.is_success() {
        return Ok(());
    }

    if matches!(response.status, 401 | 403) {
        let state = ctx.gateway.borrow().state();
        if state == SessionState::Anonymous {
            eprintln!("Not signed in. Use: uniportal login -u <username>");
        } else {
            eprintln!("The backend rejected the credential; sign in again if it has expired.");
        }
    }
    Err(anyhow!("HTTP {}", response.status))
}

fn password_or_prompt(password: Option<String>, confirm: bool) -> Result<String> {
    resolve_password(password, confirm, |prompt| rpassword::prompt_password(prompt))
}

/// Use the given password, or read one (twice when `confirm`) without echo
fn resolve_password<F>(password: Option<String>, confirm: bool, mut read: F) -> Result<String>
where
    F: FnMut(&str) -> std::io::Result<String>,
{
    if let Some(password) = password {
        return Ok(password);
    }

    let password = read("Password: ")?;
    if confirm {
        let again = read("Confirm password: ")?;
        if again != password {
            return Err(anyhow!("Passwords do not match"));
        }
    }
    Ok(password)
}

fn format_timestamp(epoch_ms: i64) -> String {
    match chrono::DateTime::from_timestamp_millis(epoch_ms) {
        Some(ts) => ts
            .with_timezone(&chrono::Local)
            .format("%a %d %b %Y %H:%M:%S")
            .to_string(),
        None => format!("at {} ms", epoch_ms),
    }
}

fn format_duration(ms: i64) -> String {
    let minutes = ms / 60_000;
    let (hours, minutes) = (minutes / 60, minutes % 60);
    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m", minutes)
    } else {
        format!("{}s", ms / 1000)
    }
}
