//! Plugin side of the channel
//!
//! [`serve`] answers requests from a host one at a time, in arrival order,
//! until the host closes its end.

use crate::{
    error::SubstrateError,
    rpc::protocol::{
        method, CallArgs, Handshake, HealthCheckArgs, InitArgs, NewSimulatedArgs, Outcome,
        QueryBlockArgs, QueryInfoArgs, Reply, Request, SetIdentityArgs, TagArgs,
        MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE,
    },
    substrate::Substrate,
    Error, Result,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

/// Serve a substrate over a byte channel until EOF
pub async fn serve<S, R, W>(substrate: Arc<S>, reader: R, mut writer: W) -> Result<()>
where
    S: Substrate + ?Sized,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                debug!(id = request.id, method = %request.method, "handling request");
                let id = request.id;
                match dispatch(substrate.as_ref(), request).await {
                    Ok(result) => Reply {
                        id,
                        result: Some(result),
                        error: None,
                    },
                    Err(error) => {
                        warn!(id, error = %error, "rejecting request");
                        Reply {
                            id,
                            result: None,
                            error: Some(error.to_string()),
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "undecodable request");
                Reply {
                    id: 0,
                    result: None,
                    error: Some(format!("undecodable request: {}", e)),
                }
            }
        };

        let mut frame = serde_json::to_vec(&reply)?;
        frame.push(b'\n');
        writer.write_all(&frame).await?;
        writer.flush().await?;
    }

    info!("host closed the channel");
    Ok(())
}

/// Run as a launched plugin: check the cookie, announce, serve stdio
pub async fn serve_stdio<S>(substrate: Arc<S>) -> Result<()>
where
    S: Substrate + ?Sized,
{
    match std::env::var(MAGIC_COOKIE_KEY) {
        Ok(value) if value == MAGIC_COOKIE_VALUE => {}
        _ => {
            return Err(Error::Handshake(
                "this binary is a substrate plugin and must be launched by a host".to_string(),
            ))
        }
    }

    let mut stdout = tokio::io::stdout();
    let mut announce = Handshake::current().line();
    announce.push('\n');
    stdout.write_all(announce.as_bytes()).await?;
    stdout.flush().await?;

    serve(substrate, BufReader::new(tokio::io::stdin()), stdout).await
}

/// Decode, invoke, encode. Errors here are protocol errors; backend failures
/// travel inside the outcome.
async fn dispatch<S>(substrate: &S, request: Request) -> Result<Value>
where
    S: Substrate + ?Sized,
{
    let params = request.params;

    match request.method.as_str() {
        method::NEW_SESSION => outcome(substrate, substrate.new_session().await),
        method::CLOSE_SESSION => {
            let args: TagArgs = decode(params)?;
            outcome(substrate, substrate.close_session(&args.tag).await)
        }
        method::NEW_SIMULATED => {
            let args: NewSimulatedArgs = decode(params)?;
            let result = substrate
                .new_simulated(&args.name, &args.version, args.snapshot.as_deref())
                .await;
            outcome(substrate, result)
        }
        method::SET_SIMULATED_IDENTITY => {
            let args: SetIdentityArgs = decode(params)?;
            let result = substrate
                .set_simulated_identity(&args.tag, &args.creator, &args.attrs)
                .await;
            outcome(substrate, result)
        }
        method::SNAPSHOT_SIMULATED => {
            let args: TagArgs = decode(params)?;
            outcome(substrate, substrate.snapshot_simulated(&args.tag).await)
        }
        method::CLOSE_SIMULATED => {
            let args: TagArgs = decode(params)?;
            outcome(substrate, substrate.close_simulated(&args.tag).await)
        }
        method::INIT => {
            let args: InitArgs = decode(params)?;
            let result = substrate.init(&args.tag, &args.phylum, &args.options).await;
            outcome(substrate, result)
        }
        method::CALL => {
            let args: CallArgs = decode(params)?;
            let result = substrate.call(&args.tag, &args.command, &args.options).await;
            outcome(substrate, result)
        }
        method::QUERY_INFO => {
            let args: QueryInfoArgs = decode(params)?;
            outcome(substrate, substrate.query_info(&args.tag, &args.options).await)
        }
        method::QUERY_BLOCK => {
            let args: QueryBlockArgs = decode(params)?;
            let result = substrate
                .query_block(&args.tag, args.height, &args.options)
                .await;
            outcome(substrate, result)
        }
        method::HEALTH_CHECK => {
            let args: HealthCheckArgs = decode(params)?;
            outcome(substrate, substrate.health_check(args.x).await)
        }
        other => Err(Error::Transport(format!("unknown method {:?}", other))),
    }
}

fn decode<A: DeserializeOwned>(params: Value) -> Result<A> {
    serde_json::from_value(params)
        .map_err(|e| Error::Transport(format!("invalid params: {}", e)))
}

fn outcome<S, T>(substrate: &S, result: Result<T>) -> Result<Value>
where
    S: Substrate + ?Sized,
    T: Serialize + Default,
{
    let outcome = match result {
        Ok(value) => Outcome { value, err: None },
        Err(Error::Application(err)) => Outcome {
            value: T::default(),
            err: Some(err),
        },
        Err(err) => Outcome {
            value: T::default(),
            err: Some(SubstrateError {
                is_timeout_error: substrate.is_timeout_error(&err),
                diagnostic: err.to_string(),
            }),
        },
    };
    Ok(serde_json::to_value(outcome)?)
}
