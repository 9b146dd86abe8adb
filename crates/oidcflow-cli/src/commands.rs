use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use oidcflow::{AuthorizedState, FlowOrchestrator, LoginOptions, LogoffOutcome, OidcClient, OidcError};
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::cli::{LoginArgs, LogoutArgs, MonitorArgs, OutputFormat};
use crate::output::{print_event, print_info, print_state, print_success, print_value};
use crate::settings::parse_params;

pub async fn login(flow: &FlowOrchestrator, args: &LoginArgs) -> Result<()> {
    let mut options = LoginOptions::default();
    if let Some(prompt) = &args.prompt {
        options = options.with_prompt(prompt.clone());
    }
    for (key, value) in parse_params(&args.params)? {
        options = options.with_param(key, value);
    }

    flow.login(options).await.context("Login failed")?;
    print_info(&format!(
        "After signing in, run: {}",
        "oidcflow callback '<redirect url>'".cyan()
    ));
    Ok(())
}

pub async fn callback(flow: &FlowOrchestrator, url: &str, format: OutputFormat) -> Result<()> {
    let state = flow
        .check_auth(Some(url))
        .await
        .context("Callback was rejected")?;
    print_state(flow.config_id(), state);
    print_session(flow, format);
    Ok(())
}

pub async fn refresh(flow: &FlowOrchestrator, format: OutputFormat) -> Result<()> {
    flow.check_auth(None).await?;
    match flow.refresh().await {
        Ok(_) => {
            print_success("Tokens renewed");
            print_session(flow, format);
            Ok(())
        }
        Err(OidcError::MissingRefreshToken) => {
            anyhow::bail!("No refresh token held; log in with the offline_access scope")
        }
        Err(OidcError::AuthenticationFailed) if !flow.is_authenticated() => {
            anyhow::bail!("Session expired and the server issued no new ID token; log in again")
        }
        Err(e) => Err(e).context("Refresh failed"),
    }
}

pub async fn status(client: &OidcClient, format: OutputFormat) -> Result<()> {
    for (config_id, result) in client.check_auth_all(None).await {
        match result {
            Ok(state) => print_state(&config_id, state),
            Err(e) => print_info(&format!("{config_id}: {e}")),
        }
        if let Ok(flow) = client.get(&config_id)
            && flow.is_authenticated()
        {
            print_session(flow, format);
        }
    }
    Ok(())
}

pub async fn userinfo(flow: &FlowOrchestrator, format: OutputFormat) -> Result<()> {
    if flow.check_auth(None).await? != AuthorizedState::Authorized {
        anyhow::bail!("Not logged in");
    }
    let claims = flow
        .fetch_user_info()
        .await
        .context("User info request failed")?;
    print_value(&claims, format);
    Ok(())
}

pub async fn logout(flow: &FlowOrchestrator, args: &LogoutArgs) -> Result<()> {
    if args.local {
        flow.logoff_local();
        print_success("Local session cleared");
        return Ok(());
    }

    flow.check_auth(None).await?;
    let outcome = if args.revoke {
        flow.logoff_and_revoke_tokens()
            .await
            .context("Token revocation failed; the local session was cleared")?
    } else {
        flow.logoff().await?
    };

    match outcome {
        LogoffOutcome::Redirected(_) => print_success("Local session cleared; finish at the provider"),
        LogoffOutcome::Posted => print_success("Logged off at the provider"),
        LogoffOutcome::LocalOnly => print_success("Local session cleared"),
    }
    Ok(())
}

pub async fn monitor(
    client: &OidcClient,
    flow: &Arc<FlowOrchestrator>,
    args: &MonitorArgs,
    format: OutputFormat,
) -> Result<()> {
    let mut events = client.events().subscribe();
    let state = flow.check_auth(None).await?;
    print_state(flow.config_id(), state);

    let deadline = args.duration.map(Duration::from_secs);
    let stop = async {
        match deadline {
            Some(duration) => tokio::time::sleep(duration).await,
            None => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    };
    tokio::pin!(stop);

    loop {
        tokio::select! {
            _ = &mut stop => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event, format),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "Event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    Ok(())
}

fn print_session(flow: &FlowOrchestrator, format: OutputFormat) {
    let claims = flow.id_token_claims();
    let summary = json!({
        "config_id": flow.config_id(),
        "state": flow.authorized_state().as_str(),
        "subject": claims.as_ref().and_then(|c| c.sub.clone()),
        "id_token_expires_at": claims.as_ref().and_then(|c| c.exp),
        "access_token_expires_at": flow.access_token_expires_at(),
        "refresh_token": flow.refresh_token().is_some(),
        "user": flow.user_data().unwrap_or(Value::Null),
    });
    print_value(&summary, format);
}
