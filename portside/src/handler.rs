//! Handler chain boundary.
//!
//! The core consults an ordered list of handlers per request. A handler
//! claims the exchange by returning `Ok(true)`; `Ok(false)` passes to the
//! next handler, and when the whole chain declines, the core answers 404.
//! A handler that claimed asynchronous completion must also claim the
//! exchange; declining after `handle_async` is a hard fault.
//!
//! `dispatch` runs on the application executor, so handlers may block
//! freely; everything it does to the response travels over the exchange
//! command channel.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::{debug, error};

use crate::error::Error;
use crate::exchange::ResponseCmd;
use crate::request::Request;
use crate::response::Response;

/// An application request handler.
///
/// `Ok(true)` claims the exchange, `Ok(false)` defers to the next handler
/// in the chain, `Err` aborts with the error's mapped status.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: &mut Request, response: &mut Response) -> Result<bool, Error>;
}

impl<F> Handler for F
where
    F: Fn(&mut Request, &mut Response) -> Result<bool, Error> + Send + Sync + 'static,
{
    fn handle(&self, request: &mut Request, response: &mut Response) -> Result<bool, Error> {
        self(request, response)
    }
}

/// Hook consulted for handler errors before any response bytes exist.
/// Returning `true` suppresses the default error page.
pub trait UnhandledErrorHandler: Send + Sync + 'static {
    fn handle(&self, request: &mut Request, response: &mut Response, error: &Error) -> bool;
}

/// Immutable per-server dispatch context.
pub(crate) struct DispatchCtx {
    pub handlers: Vec<Arc<dyn Handler>>,
    pub error_handler: Option<Arc<dyn UnhandledErrorHandler>>,
}

/// Run the handler chain for one exchange.
pub(crate) fn dispatch(ctx: &DispatchCtx, mut request: Request, mut response: Response) {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        run_chain(ctx, &mut request, &mut response)
    }))
    .unwrap_or_else(|panic| {
        error!("handler panicked: {}", panic_message(&panic));
        Err(Error::Internal("handler panicked".into()))
    });

    match outcome {
        Ok(ChainOutcome::Async) => {
            // The handler owns completion. If it never produced a head,
            // commit the one it configured so async writes can flow.
            if !response.has_started() {
                let (status, headers) = response.snapshot();
                response.shared().send(ResponseCmd::Start {
                    status: status.unwrap_or(200),
                    headers,
                });
            }
        }
        Ok(ChainOutcome::Handled) => {
            let (status, headers) = response.snapshot();
            response.shared().send(ResponseCmd::Complete {
                error: None,
                status,
                headers,
            });
        }
        Ok(ChainOutcome::NotHandled) => {
            debug!(path = request.path(), "no handler matched");
            response.write_error_page(404, "This page is not available. Sorry about that.");
            let (status, headers) = response.snapshot();
            response.shared().send(ResponseCmd::Complete {
                error: None,
                status,
                headers,
            });
        }
        Err(err) => fail_exchange(ctx, &mut request, &mut response, err),
    }
}

enum ChainOutcome {
    Handled,
    NotHandled,
    Async,
}

fn run_chain(
    ctx: &DispatchCtx,
    request: &mut Request,
    response: &mut Response,
) -> Result<ChainOutcome, Error> {
    for handler in &ctx.handlers {
        let claimed = handler.handle(request, response)?;
        if request.async_claimed() {
            if !claimed {
                return Err(Error::IllegalHandlerState);
            }
            return Ok(ChainOutcome::Async);
        }
        if claimed {
            return Ok(ChainOutcome::Handled);
        }
    }
    if request.async_claimed() {
        return Err(Error::IllegalHandlerState);
    }
    Ok(ChainOutcome::NotHandled)
}

/// Map a handler failure onto the wire.
fn fail_exchange(ctx: &DispatchCtx, request: &mut Request, response: &mut Response, err: Error) {
    if response.has_started() {
        // The head is on the wire; nothing can be amended. The driver
        // closes the connection.
        error!(error = %err, "handler failed after response started");
        let (status, headers) = response.snapshot();
        response.shared().send(ResponseCmd::Complete {
            error: Some(err),
            status,
            headers,
        });
        return;
    }

    if let Some(hook) = &ctx.error_handler {
        if hook.handle(request, response, &err) {
            let (status, headers) = response.snapshot();
            response.shared().send(ResponseCmd::Complete {
                error: None,
                status,
                headers,
            });
            return;
        }
    }

    match &err {
        Error::RedirectRequired { target } => {
            response.status(301);
            response.header("location", target.clone());
            let _ = response.write(bytes::Bytes::new());
        }
        _ => {
            let status = err.response_status();
            response.write_error_page(status, &err.to_string());
        }
    }

    let close = err.closes_connection();
    let (status, headers) = response.snapshot();
    response.shared().send(ResponseCmd::Complete {
        error: close.then_some(err),
        status,
        headers,
    });
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{BodyReader, ExchangeId, ExchangeShared};
    use crate::exec::ExecHandle;
    use crate::headers::HeaderMap;
    use crate::request::Protocol;
    use portside_h1::{Method, Version};
    use tokio::sync::mpsc;

    fn exchange_parts() -> (
        Request,
        Response,
        mpsc::UnboundedReceiver<(ExchangeId, ResponseCmd)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = ExchangeShared::new(1, tx);
        let request = Request::new(
            Method::Get,
            "/t".into(),
            None,
            Version::Http11,
            Protocol::Http1,
            HeaderMap::new(),
            BodyReader::empty(),
            "127.0.0.1:9999".parse().unwrap(),
            Arc::clone(&shared),
            ExecHandle::inline_for_tests(),
        );
        (request, Response::new(shared), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<(ExchangeId, ResponseCmd)>) -> Vec<ResponseCmd> {
        let mut cmds = Vec::new();
        while let Ok((_, cmd)) = rx.try_recv() {
            cmds.push(cmd);
        }
        cmds
    }

    fn ctx(handlers: Vec<Arc<dyn Handler>>) -> DispatchCtx {
        DispatchCtx {
            handlers,
            error_handler: None,
        }
    }

    #[test]
    fn unclaimed_request_gets_404() {
        let (request, response, mut rx) = exchange_parts();
        let ctx = ctx(vec![Arc::new(|_req: &mut Request, _resp: &mut Response| Ok(false))]);
        dispatch(&ctx, request, response);

        let cmds = drain(&mut rx);
        assert!(matches!(cmds[0], ResponseCmd::Full { status: 404, .. }));
        assert!(matches!(cmds[1], ResponseCmd::Complete { error: None, .. }));
    }

    #[test]
    fn chain_stops_at_first_claim() {
        let (request, response, mut rx) = exchange_parts();
        let ctx = ctx(vec![
            Arc::new(|_req: &mut Request, _resp: &mut Response| Ok(false)),
            Arc::new(|_req: &mut Request, resp: &mut Response| {
                resp.write("claimed")?;
                Ok(true)
            }),
            Arc::new(|_req: &mut Request, _resp: &mut Response| -> Result<bool, Error> {
                panic!("must not run")
            }),
        ]);
        dispatch(&ctx, request, response);

        let cmds = drain(&mut rx);
        assert!(matches!(cmds[0], ResponseCmd::Full { status: 200, .. }));
        assert!(matches!(cmds[1], ResponseCmd::Complete { error: None, .. }));
    }

    #[test]
    fn handler_error_renders_status_page() {
        let (request, response, mut rx) = exchange_parts();
        let ctx = ctx(vec![Arc::new(
            |_req: &mut Request, _resp: &mut Response| -> Result<bool, Error> {
                Err(Error::with_status(409, "conflict"))
            },
        )]);
        dispatch(&ctx, request, response);

        let cmds = drain(&mut rx);
        match &cmds[0] {
            ResponseCmd::Full { status, body, .. } => {
                assert_eq!(*status, 409);
                assert!(std::str::from_utf8(body).unwrap().contains("<h1>409"));
            }
            _ => panic!("expected error page"),
        }
        // A handler-status error keeps the connection.
        assert!(matches!(cmds[1], ResponseCmd::Complete { error: None, .. }));
    }

    #[test]
    fn panicking_handler_maps_to_500() {
        let (request, response, mut rx) = exchange_parts();
        let ctx = ctx(vec![Arc::new(
            |_req: &mut Request, _resp: &mut Response| -> Result<bool, Error> {
                panic!("boom");
            },
        )]);
        dispatch(&ctx, request, response);

        let cmds = drain(&mut rx);
        assert!(matches!(cmds[0], ResponseCmd::Full { status: 500, .. }));
        assert!(matches!(cmds[1], ResponseCmd::Complete { error: Some(_), .. }));
    }

    #[test]
    fn not_handled_after_async_claim_is_illegal() {
        let (request, response, mut rx) = exchange_parts();
        let ctx = ctx(vec![Arc::new(|req: &mut Request, _resp: &mut Response| {
            let _handle = req.handle_async();
            Ok(false)
        })]);
        dispatch(&ctx, request, response);

        let cmds = drain(&mut rx);
        assert!(matches!(cmds[0], ResponseCmd::Full { status: 500, .. }));
    }

    #[test]
    fn async_claim_commits_head_without_completing() {
        let (request, response, mut rx) = exchange_parts();
        let ctx = ctx(vec![Arc::new(|req: &mut Request, resp: &mut Response| {
            resp.status(200);
            resp.header("x-mode", "async");
            let _handle = req.handle_async();
            Ok(true)
        })]);
        dispatch(&ctx, request, response);

        let cmds = drain(&mut rx);
        assert_eq!(cmds.len(), 1);
        match &cmds[0] {
            ResponseCmd::Start { status, headers } => {
                assert_eq!(*status, 200);
                assert!(headers.contains(&("x-mode".into(), "async".into())));
            }
            _ => panic!("expected Start, not Complete"),
        }
    }

    #[test]
    fn error_hook_can_suppress_default_page() {
        struct Hook;
        impl UnhandledErrorHandler for Hook {
            fn handle(&self, _req: &mut Request, resp: &mut Response, _err: &Error) -> bool {
                resp.status(200);
                let _ = resp.write("recovered");
                true
            }
        }

        let (request, response, mut rx) = exchange_parts();
        let ctx = DispatchCtx {
            handlers: vec![Arc::new(
                |_req: &mut Request, _resp: &mut Response| -> Result<bool, Error> {
                    Err(Error::Internal("oops".into()))
                },
            )],
            error_handler: Some(Arc::new(Hook)),
        };
        dispatch(&ctx, request, response);

        let cmds = drain(&mut rx);
        match &cmds[0] {
            ResponseCmd::Full { status, body, .. } => {
                assert_eq!(*status, 200);
                assert_eq!(body, "recovered");
            }
            _ => panic!("expected hook response"),
        }
        assert!(matches!(cmds[1], ResponseCmd::Complete { error: None, .. }));
    }
}
