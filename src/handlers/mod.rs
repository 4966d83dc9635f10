//! Development gateway handlers
//!
//! Enough of an auth gateway to exercise the full handshake: the client's
//! credentials are checked for a matching build and a non-empty account,
//! nothing more. A production deployment registers its own handlers for the
//! same opcodes instead.

use crate::network::{DispatchBuilder, DispatchError, HandlerContext, HandlerError, HandlerResult};
use crate::protocol::message::{
    deny_codes, ClientHeartbeat, ClientHelloAuth, ServerAuthAccepted, ServerAuthDenied,
    ServerHeartbeat,
};
use crate::protocol::PROTOCOL_VERSION;

/// Session key under which the authenticated account name is stored
pub const SESSION_ACCOUNT: &str = "account";

/// Session key under which the account id is stored
pub const SESSION_ACCOUNT_ID: &str = "account_id";

/// Register the development handshake and keep-alive handlers
pub fn register_gateway_handlers(builder: DispatchBuilder) -> Result<DispatchBuilder, DispatchError> {
    builder
        .on(client_hello_auth)?
        .on_authenticated(client_heartbeat)
}

fn client_hello_auth(hello: ClientHelloAuth, ctx: &mut HandlerContext<'_>) -> HandlerResult {
    if hello.build != PROTOCOL_VERSION {
        ctx.send(&denied(deny_codes::VERSION_MISMATCH, hello.build));
        return Err(HandlerError::failed(format!(
            "client build {} does not match {}",
            hello.build, PROTOCOL_VERSION
        )));
    }

    if hello.account.is_empty() {
        ctx.send(&denied(deny_codes::INVALID_TOKEN, 0));
        return Err(HandlerError::failed("empty account name"));
    }

    let account_id = account_id(&hello.account);
    tracing::info!(
        connection = %ctx.connection_id(),
        account_id,
        "Account {} authenticated",
        hello.account
    );

    ctx.send(&ServerAuthAccepted {
        account_id,
        session_key: hello.token,
    });
    ctx.session_mut().insert(SESSION_ACCOUNT_ID, account_id);
    ctx.session_mut().insert(SESSION_ACCOUNT, hello.account);
    ctx.mark_authenticated();
    Ok(())
}

fn client_heartbeat(ping: ClientHeartbeat, ctx: &mut HandlerContext<'_>) -> HandlerResult {
    ctx.send(&ServerHeartbeat {
        timestamp: ping.timestamp,
    });
    Ok(())
}

fn denied(reason: u32, error_value: u32) -> ServerAuthDenied {
    ServerAuthDenied {
        reason,
        error_value,
        suspended_days: 0,
    }
}

/// Stable id derived from the account name (32-bit FNV-1a)
fn account_id(account: &str) -> u32 {
    account
        .to_lowercase()
        .bytes()
        .fold(0x811C_9DC5, |hash, byte| (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193))
}
