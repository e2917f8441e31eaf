//! `#[test_timeout::timeout]` and `#[test_timeout::tokio_timeout_test]`.
//!
//! Both run the test body on a helper thread and panic if it does not finish
//! within the budget. The budget is the attribute argument (seconds, default
//! 30) unless `RENDEZVOUS_TEST_TIMEOUT_SECS` is set when the test runs.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const OVERRIDE_VAR: &str = "RENDEZVOUS_TEST_TIMEOUT_SECS";

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = match parse_timeout(attr) {
        Ok(secs) => secs,
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

    let attrs = strip_test_attrs(attrs);
    let budget = budget_expr(timeout_secs);
    let body = quote! {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(timeout_duration, async move #block)
                .await
                .expect("test timed out");
        });
    };
    wrap(attrs, vis, sig, budget, body).into()
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function; use tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip_test_attrs(attrs);
    let budget = budget_expr(timeout_secs);
    let body = quote! {
        let _ = timeout_duration;
        (|| #block)();
    };
    wrap(attrs, vis, sig, budget, body).into()
}

fn parse_timeout(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

fn budget_expr(timeout_secs: u64) -> TokenStream2 {
    quote! {
        std::time::Duration::from_secs(
            std::env::var(#OVERRIDE_VAR)
                .ok()
                .and_then(|value| value.trim().parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(#timeout_secs),
        )
    }
}

/// Emits the `#[test]` shell: run `body` on a helper thread and race it
/// against the budget.
fn wrap(
    attrs: Vec<Attribute>,
    vis: syn::Visibility,
    sig: syn::Signature,
    budget: TokenStream2,
    body: TokenStream2,
) -> TokenStream2 {
    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let timeout_duration = #budget;
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    #body
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test timed out after {:?}", timeout_duration)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    }
}

fn strip_test_attrs(attrs: Vec<Attribute>) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect()
}

/// Matches `#[test]` and `#[tokio::test]` so they are not applied twice.
fn is_test_attribute(attr: &Attribute) -> bool {
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
