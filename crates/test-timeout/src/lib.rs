//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[test_timeout::timeout(secs)]` wraps a synchronous test and
//! `#[test_timeout::tokio_timeout_test(secs)]` an async one, driving it on a
//! fresh current-thread runtime. The body runs on its own thread so a
//! deadlocked test still reports after `secs` (default 60).

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut function = parse_macro_input!(item as ItemFn);
    let secs = match parse_timeout(attr.into()) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    if function.sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &function.sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    function.sig.asyncness = None;

    let block = &function.block;
    let body = quote! {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(timeout_duration, async move #block)
                .await
                .expect("test timed out");
        });
    };
    watchdog(function, secs, body, |path| path_is(path, &["tokio", "test"])).into()
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let function = parse_macro_input!(item as ItemFn);
    let secs = match parse_timeout(attr.into()) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    if function.sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &function.sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }

    let block = &function.block;
    let body = quote! { #block };
    watchdog(function, secs, body, |path| path_is(path, &["test"])).into()
}

fn parse_timeout(attr: TokenStream2) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse2(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

fn path_is(path: &syn::Path, expected: &[&str]) -> bool {
    path.segments.len() == expected.len()
        && path
            .segments
            .iter()
            .zip(expected)
            .all(|(segment, name)| segment.ident == name)
}

/// Emits a `#[test]` that runs `body` on a helper thread and panics if it has
/// not reported back within `secs`. Attributes matching `drop_attr` are
/// removed so they don't register the test twice.
fn watchdog(
    function: ItemFn,
    secs: u64,
    body: TokenStream2,
    drop_attr: impl Fn(&syn::Path) -> bool,
) -> TokenStream2 {
    let ItemFn { attrs, vis, sig, .. } = function;
    let attrs: Vec<Attribute> = attrs.into_iter().filter(|attr| !drop_attr(attr.path())).collect();

    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
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
