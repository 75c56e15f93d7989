use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use nexora_gate::backend::http::HttpIdentityBackend;
use nexora_gate::cache::{CacheError, FileStore, PersistentCache};
use nexora_gate::config::ConfigError;
use nexora_gate::route::{Route, RouteError};
use nexora_gate::session::{Address, Role, SignUpError, SignUpRequest};
use nexora_gate::{
    BackendError, InstituteContext, InstituteState, Location, NavigationOutcome, Navigator, Portal, PortalConfig,
    ResolutionError, SessionState,
};
use serde_json::{Value, json};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("sign-up failed: {0}")]
    SignUp(#[from] SignUpError),
    #[error("{0}")]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("unknown role '{0}' (expected admin, teacher or student)")]
    InvalidRole(String),
}

#[derive(Parser, Debug)]
#[command(name = "nexora-gate", about = "Nexora portal session and institute gate")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the session, profile and institute context.
    Status,
    /// Resolve the institute context.
    Resolve {
        #[arg(long)]
        institute: Option<String>,
    },
    /// Verify an institute id at the access gateway and make it current.
    Verify { institute_id: String },
    /// Run the route guard for a location such as `/#/dashboard?institute=SIT-2026`.
    Navigate { location: String },
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "NEXORA_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long, help = "admin, teacher or student (needs role_selection)")]
        role: Option<String>,
    },
    Signup(SignupArgs),
    Logout,
    /// Forget the current institute.
    ChangeInstitute,
}

#[derive(Args, Debug)]
struct SignupArgs {
    #[arg(long)]
    institute_id: String,
    #[arg(long)]
    institution_name: String,
    #[arg(long, default_value = "")]
    institution_type: String,
    #[arg(long)]
    full_name: String,
    #[arg(long)]
    email: String,
    #[arg(long, default_value = "")]
    phone: String,
    #[arg(long, env = "NEXORA_PASSWORD", hide_env_values = true)]
    password: String,
    #[arg(long, env = "NEXORA_PASSWORD_CONFIRM", hide_env_values = true)]
    password_confirm: String,
    #[arg(long, default_value = "")]
    street: String,
    #[arg(long, default_value = "")]
    city: String,
    #[arg(long, default_value = "")]
    state: String,
    #[arg(long, default_value = "")]
    country: String,
    #[arg(long, default_value = "")]
    zip_code: String,
}

impl From<SignupArgs> for SignUpRequest {
    fn from(args: SignupArgs) -> Self {
        SignUpRequest {
            institute_id: args.institute_id,
            institution_name: args.institution_name,
            institution_type: args.institution_type,
            email: args.email,
            phone: args.phone,
            full_name: args.full_name,
            password: args.password,
            password_confirm: args.password_confirm,
            address: Address {
                street: args.street,
                city: args.city,
                state: args.state,
                country: args.country,
                zip_code: args.zip_code,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!(error = %e, "no .env file loaded");
    }

    let cli = Cli::parse();
    let config = PortalConfig::from_env()?;
    let portal = build_portal(config)?;

    let result = match cli.command {
        Command::Status => run_status(&portal).await,
        Command::Resolve { institute } => run_resolve(&portal, institute.as_deref()).await,
        Command::Verify { institute_id } => run_verify(&portal, &institute_id).await,
        Command::Navigate { location } => run_navigate(&portal, &location).await,
        Command::Login { email, password, role } => run_login(&portal, &email, &password, role.as_deref()).await,
        Command::Signup(args) => run_signup(&portal, args).await,
        Command::Logout => run_logout(&portal).await,
        Command::ChangeInstitute => {
            portal.change_institute();
            print_json(&json!({ "institute": institute_json(&portal.institute_state()) }))
        }
    };
    portal.detach();
    result
}

fn build_portal(config: PortalConfig) -> Result<Portal, CliError> {
    let cache = PersistentCache::new(Arc::new(FileStore::new(&config.cache_path)), config.cache_namespace);
    let backend = HttpIdentityBackend::new(&config.backend_url, config.api_key, config.timeouts, cache.clone())?;
    let navigator: Arc<dyn Navigator> = Arc::new(|href: &str| eprintln!("navigate: {href}"));
    Ok(Portal::new(Arc::new(backend), cache, navigator, config.features).with_support_email(config.support_email))
}

async fn run_status(portal: &Portal) -> Result<(), CliError> {
    let session = portal.session().ready().await;
    let institute = portal.reload_institute().await;
    print_json(&json!({
        "session": session_json(&session),
        "profile": portal.session().profile(),
        "institute": institute_json(&institute),
    }))
}

async fn run_resolve(portal: &Portal, institute: Option<&str>) -> Result<(), CliError> {
    let resolution = portal.resolver().resolve(institute).await?;
    let state = InstituteState::from_result(Ok(resolution));
    print_json(&institute_json(&state))
}

async fn run_verify(portal: &Portal, institute_id: &str) -> Result<(), CliError> {
    let ctx = match portal.select_institute(institute_id).await {
        Ok(ctx) => ctx,
        Err(e) => {
            if let Some(link) = portal.support_link(&e) {
                eprintln!("{}\nsupport: {link}", e.notice());
            }
            return Err(e.into());
        }
    };
    let next = portal.continue_to_login(&ctx);
    print_json(&json!({ "institute": context_json(&ctx), "next": next }))
}

async fn run_navigate(portal: &Portal, location: &str) -> Result<(), CliError> {
    let outcome = portal.navigate(location).await?;
    print_json(&outcome_json(&outcome))
}

async fn run_login(portal: &Portal, email: &str, password: &str, role: Option<&str>) -> Result<(), CliError> {
    let session = portal.session().sign_in(email, password).await?;
    if let Some(raw) = role {
        let role = Role::parse(raw).ok_or_else(|| CliError::InvalidRole(raw.to_owned()))?;
        portal.session().set_role_hint(role)?;
    }
    portal.reload_institute().await;
    let outcome = portal.reevaluate(Location::new(Route::LOGIN));
    print_json(&json!({
        "user_id": session.user_id,
        "profile": portal.session().profile(),
        "guard": outcome_json(&outcome),
    }))
}

async fn run_signup(portal: &Portal, args: SignupArgs) -> Result<(), CliError> {
    let request = SignUpRequest::from(args);
    let outcome = portal.session().sign_up(&request).await?;
    let next = if outcome.email_confirmation_required && portal.features().email_verification {
        Route::VerifyEmail.path()
    } else {
        Route::LOGIN.path()
    };
    print_json(&json!({
        "user_id": outcome.user_id,
        "email_confirmation_required": outcome.email_confirmation_required,
        "next": next,
    }))
}

async fn run_logout(portal: &Portal) -> Result<(), CliError> {
    portal.session().ready().await;
    portal.logout().await?;
    print_json(&json!({ "signed_out": true }))
}

// =============================================================================
// OUTPUT
// =============================================================================

fn session_json(state: &SessionState) -> Value {
    json!({
        "phase": format!("{:?}", state.phase),
        "email": state.session.as_ref().map(|s| s.email.clone()),
        "display_name": state.session.as_ref().map(|s| s.display_name.clone()),
        "error": state.error.as_ref().map(ToString::to_string),
    })
}

fn context_json(ctx: &InstituteContext) -> Value {
    serde_json::to_value(ctx).unwrap_or(Value::Null)
}

fn institute_json(state: &InstituteState) -> Value {
    match state {
        InstituteState::Pending => json!({ "state": "pending" }),
        InstituteState::Missing => json!({ "state": "no_context" }),
        InstituteState::Resolved(ctx) => json!({ "state": "resolved", "context": context_json(ctx) }),
        InstituteState::Failed(e) => json!({
            "state": "failed",
            "institute_id": e.institute_id(),
            "error": e.to_string(),
            "notice": e.notice(),
            "retryable": e.is_retryable(),
        }),
    }
}

fn outcome_json(outcome: &NavigationOutcome) -> Value {
    json!({
        "route": outcome.location.route.path(),
        "decision": format!("{:?}", outcome.decision),
        "redirect": outcome.redirect,
        "notice": outcome.notice.as_ref().map(ResolutionError::notice),
        "support_link": outcome.support_link,
        "superseded": outcome.superseded,
    })
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
