use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

/// Runs the annotated test on a watchdog thread so a wedged test fails the
/// suite instead of hanging it. Takes an optional deadline in seconds,
/// defaulting to 30: `#[test_deadline::deadline(5)]`.
///
/// Works on both sync and async test functions; async bodies are driven on a
/// fresh current-thread tokio runtime and additionally raced against the
/// deadline inside the runtime, so a stuck await reports a timeout rather
/// than an abandoned thread.
#[proc_macro_attribute]
pub fn deadline(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs: u64 = if attr.is_empty() {
        30
    } else {
        let lit = parse_macro_input!(attr as LitInt);
        match lit.base10_parse() {
            Ok(0) | Err(_) => {
                return syn::Error::new_spanned(lit, "deadline expects a positive integer literal")
                    .to_compile_error()
                    .into();
            }
            Ok(secs) => secs,
        }
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    let body = if sig.asyncness.take().is_some() {
        quote! {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build tokio runtime")
                .block_on(async {
                    tokio::time::timeout(__deadline, async move #block)
                        .await
                        .expect("test exceeded its deadline");
                });
        }
    } else {
        quote! { #block }
    };

    let kept_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attr(attr))
        .collect();

    TokenStream::from(quote! {
        #[test]
        #(#kept_attrs)*
        #vis #sig {
            let __deadline = std::time::Duration::from_secs(#secs);
            let (report, outcome) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
                let _ = report.send(result);
            });
            match outcome.recv_timeout(__deadline) {
                Ok(Ok(())) => {}
                Ok(Err(panic)) => std::panic::resume_unwind(panic),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded its {}s deadline", __deadline.as_secs())
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test worker exited without reporting a result")
                }
            }
        }
    })
}

/// Matches `#[test]` and `#[tokio::test]` so the generated `#[test]` is not
/// doubled up when callers stack attributes.
fn is_test_attr(attr: &Attribute) -> bool {
    attr.path()
        .segments
        .last()
        .is_some_and(|segment| segment.ident == "test")
}
