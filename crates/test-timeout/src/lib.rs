use proc_macro::TokenStream;
use quote::quote;
use syn::punctuated::Punctuated;
use syn::{Attribute, Expr, ItemFn, Lit, Meta, Token, parse_macro_input};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

struct TestOptions {
    timeout_secs: u64,
    paused: bool,
}

impl TestOptions {
    fn parse(args: Punctuated<Meta, Token![,]>) -> syn::Result<Self> {
        let mut options = TestOptions {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            paused: false,
        };
        for meta in args {
            match meta {
                Meta::Path(path) if path.is_ident("paused") => options.paused = true,
                Meta::NameValue(pair) if pair.path.is_ident("secs") => {
                    let Expr::Lit(expr) = &pair.value else {
                        return Err(syn::Error::new_spanned(&pair.value, "secs expects an integer"));
                    };
                    let Lit::Int(lit) = &expr.lit else {
                        return Err(syn::Error::new_spanned(&expr.lit, "secs expects an integer"));
                    };
                    let secs: u64 = lit.base10_parse()?;
                    if secs == 0 {
                        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
                    }
                    options.timeout_secs = secs;
                }
                other => {
                    return Err(syn::Error::new_spanned(
                        other,
                        "expected `secs = <n>` or `paused`",
                    ));
                }
            }
        }
        Ok(options)
    }
}

/// Runs an async test on its own current-thread runtime, failing it if it
/// does not finish within the budget.
///
/// `#[tokio_timeout_test(secs = 20, paused)]` starts the runtime with a
/// paused clock so timer-driven handshake logic advances instantly; the
/// budget is then enforced on wall-clock time only. `paused` needs tokio's
/// `test-util` feature in the calling crate.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr with Punctuated::<Meta, Token![,]>::parse_terminated);
    let options = match TestOptions::parse(args) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_harness_attribute(attr))
        .collect();

    let secs = options.timeout_secs;
    // A paused clock auto-advances through sleeps, so only the wall-clock
    // guard below is meaningful there.
    let (pause, body) = if options.paused {
        (
            quote! { builder.start_paused(true); },
            quote! { runtime.block_on(async move #block); },
        )
    } else {
        (
            quote! {},
            quote! {
                runtime.block_on(async {
                    tokio::time::timeout(budget, async move #block)
                        .await
                        .expect("test timed out");
                });
            },
        )
    };

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let budget = std::time::Duration::from_secs(#secs);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let mut builder = tokio::runtime::Builder::new_current_thread();
                    builder.enable_all();
                    #pause
                    let runtime = builder.build().expect("failed to build Tokio runtime");
                    #body
                }));
                let _ = done_tx.send(outcome);
            });
            match done_rx.recv_timeout(budget + std::time::Duration::from_secs(5)) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited before reporting a result")
                }
            }
        }
    })
}

fn is_test_harness_attribute(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
