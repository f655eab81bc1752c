//! Test attributes that fail a test instead of letting it hang.
//!
//! Both attributes accept either a bare number of seconds or `secs = N`.
//! `tokio_timeout_test` additionally takes `multi_thread` to run the body on a
//! multi-threaded runtime:
//!
//! ```ignore
//! #[tokio_timeout_test(10)]
//! async fn handshake() { /* ... */ }
//!
//! #[tokio_timeout_test(secs = 30, multi_thread)]
//! async fn many_pairs() { /* ... */ }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

struct TimeoutArgs {
    secs: u64,
    multi_thread: bool,
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            secs: DEFAULT_TIMEOUT_SECS,
            multi_thread: false,
        };
        while !input.is_empty() {
            if input.peek(LitInt) {
                args.secs = parse_secs(&input.parse()?)?;
            } else {
                let key: Ident = input.parse()?;
                match key.to_string().as_str() {
                    "secs" => {
                        input.parse::<Token![=]>()?;
                        args.secs = parse_secs(&input.parse()?)?;
                    }
                    "multi_thread" => args.multi_thread = true,
                    other => {
                        return Err(syn::Error::new(
                            key.span(),
                            format!("unknown timeout argument `{other}`"),
                        ))
                    }
                }
            }
            if input.is_empty() {
                break;
            }
            input.parse::<Token![,]>()?;
        }
        Ok(args)
    }
}

fn parse_secs(lit: &LitInt) -> syn::Result<u64> {
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new(lit.span(), "timeout must be greater than zero"));
    }
    Ok(secs)
}

/// Runs `body` (an expression evaluating to `()`) on a watchdog thread and
/// panics if it does not report back within `secs`.
fn watchdog(secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let timeout_duration = ::std::time::Duration::from_secs(#secs);
        let (sender, receiver) = ::std::sync::mpsc::channel();
        ::std::thread::spawn(move || {
            let result = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| #body));
            let _ = sender.send(result);
        });
        match receiver.recv_timeout(timeout_duration) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
            Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test exceeded its {}s timeout", #secs)
            }
            Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread failed before reporting result")
            }
        }
    }
}

fn has_path(attr: &Attribute, expected: &[&str]) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    segments.iter().map(String::as_str).eq(expected.iter().copied())
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
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
        .filter(|attr| !has_path(attr, &["tokio", "test"]))
        .collect();

    let builder = if args.multi_thread {
        quote!(::tokio::runtime::Builder::new_multi_thread().worker_threads(4))
    } else {
        quote!(::tokio::runtime::Builder::new_current_thread())
    };
    let secs = args.secs;
    let body = quote!({
        let runtime = #builder
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            ::tokio::time::timeout(::std::time::Duration::from_secs(#secs), async move #block)
                .await
                .expect("test timed out");
        });
    });
    let guarded = watchdog(secs, body);

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #guarded
        }
    })
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }
    if args.multi_thread {
        return syn::Error::new_spanned(
            &sig.ident,
            "multi_thread only applies to tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !has_path(attr, &["test"]))
        .collect();
    let guarded = watchdog(args.secs, quote!(#block));

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #guarded
        }
    })
}
