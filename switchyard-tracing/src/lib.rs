//! Attribute macros that bracket a function with trace events.
//!
//! ```ignore
//! #[traced(instrument(level = tracing::Level::DEBUG, skip_all), timing(precision = "ms"))]
//! fn load(&mut self) { ... }
//! ```
//!
//! The expansion emits an `enter` event when the function starts and an `exit`
//! event when its guard drops, optionally carrying the elapsed time. The
//! calling crate must depend on `tracing`.

extern crate proc_macro;

use proc_macro2::{Span, TokenStream};
use quote::{quote, quote_spanned};
use syn::{Ident, ItemFn, Stmt, parse::Parse, parse_macro_input, parse_quote};

mod keywords {
    syn::custom_keyword!(timing);
    syn::custom_keyword!(precision);
    syn::custom_keyword!(instrument);
    syn::custom_keyword!(level);
}

#[derive(PartialEq, Eq, Clone, Copy, Default)]
enum Precision {
    #[default]
    Nanos,
    Micros,
    Millis,
    Seconds,
}

impl Precision {
    fn from_unit(unit: &str) -> Option<Self> {
        match unit {
            "ns" | "nanos" | "nanoseconds" => Some(Self::Nanos),
            "us" | "micros" | "microseconds" => Some(Self::Micros),
            "ms" | "millis" | "milliseconds" => Some(Self::Millis),
            "s" | "secs" | "seconds" => Some(Self::Seconds),
            _ => None,
        }
    }

    /// Expression turning an `Instant` named `started` into a display string.
    fn elapsed(self) -> syn::Expr {
        match self {
            Self::Nanos => parse_quote!(format!("{}ns", started.elapsed().as_nanos())),
            Self::Micros => parse_quote!(format!("{}us", started.elapsed().as_micros())),
            Self::Millis => parse_quote!(format!("{}ms", started.elapsed().as_millis())),
            Self::Seconds => parse_quote!(format!("{:.3}s", started.elapsed().as_secs_f64())),
        }
    }
}

impl Parse for Precision {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        if !input.peek(syn::token::Paren) {
            return Ok(Self::default());
        }

        let content;
        syn::parenthesized!(content in input);
        content.parse::<keywords::precision>()?;
        content.parse::<syn::Token![=]>()?;
        let unit = content.parse::<syn::LitStr>()?;

        Self::from_unit(&unit.value())
            .ok_or_else(|| syn::Error::new(unit.span(), "unknown timing precision"))
    }
}

#[derive(Default)]
struct Attributes {
    timing: Option<Precision>,
    instrument: Option<TokenStream>,
    level: Option<Ident>,
    unrecognised: Vec<syn::Error>,
}

impl Attributes {
    fn event_macro(&self) -> Ident {
        self.level
            .clone()
            .unwrap_or_else(|| Ident::new("trace", Span::call_site()))
    }

    /// Unknown arguments become deprecation warnings rather than hard errors.
    fn warnings(&self) -> TokenStream {
        let warnings = self.unrecognised.iter().map(|err| {
            let note = syn::LitStr::new(&format!("traced: ignored argument, {err}"), err.span());
            quote_spanned! {err.span()=>
                #[warn(deprecated)]
                {
                    #[deprecated(since = "never", note = #note)]
                    const TRACED_ARGUMENT_IGNORED: () = ();
                    let () = TRACED_ARGUMENT_IGNORED;
                }
            }
        });

        quote! { #(#warnings)* }
    }
}

impl Parse for Attributes {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        let mut attributes = Self::default();

        while !input.is_empty() {
            let lookahead = input.lookahead1();
            if lookahead.peek(keywords::timing) {
                if attributes.timing.is_some() {
                    return Err(input.error("`timing` given more than once"));
                }
                input.parse::<keywords::timing>()?;
                attributes.timing = Some(input.parse()?);
            } else if lookahead.peek(keywords::instrument) {
                if attributes.instrument.is_some() {
                    return Err(input.error("`instrument` given more than once"));
                }
                input.parse::<keywords::instrument>()?;
                let mut fields = TokenStream::new();
                if input.peek(syn::token::Paren) {
                    let content;
                    syn::parenthesized!(content in input);
                    fields = content.parse()?;
                }
                attributes.instrument = Some(fields);
            } else if lookahead.peek(keywords::level) {
                input.parse::<keywords::level>()?;
                input.parse::<syn::Token![=]>()?;
                let level = input.parse::<syn::LitStr>()?;
                match level.value().as_str() {
                    "trace" | "debug" | "info" => {
                        attributes.level = Some(Ident::new(&level.value(), level.span()));
                    }
                    _ => return Err(syn::Error::new(level.span(), "unsupported event level")),
                }
            } else if lookahead.peek(syn::Token![,]) {
                input.parse::<syn::Token![,]>()?;
            } else {
                attributes.unrecognised.push(lookahead.error());
                input.parse::<proc_macro2::TokenTree>()?;
            }
        }

        Ok(attributes)
    }
}

/// Emits `enter`/`exit` events around the attributed function.
///
/// Arguments:
/// - `instrument(...)`: forwarded to `#[tracing::instrument(...)]`
/// - `timing(precision = "ms")`: report the elapsed time on exit
/// - `level = "debug"`: level of the enter/exit events (default `trace`)
///
/// # Panics
///
/// Fails to compile when applied to anything other than a function.
#[proc_macro_attribute]
pub fn traced(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    let args = parse_macro_input!(args as Attributes);
    let mut item_fn = parse_macro_input!(item as ItemFn);

    let warnings = args.warnings();
    let event = args.event_macro();
    let name = item_fn.sig.ident.to_string();

    item_fn
        .attrs
        .push(parse_quote! { #[allow(clippy::items_after_statements)] });
    if let Some(fields) = &args.instrument {
        item_fn
            .attrs
            .push(parse_quote! { #[::tracing::instrument(#fields)] });
    }

    let on_exit: Stmt = match args.timing {
        Some(precision) => {
            let elapsed = precision.elapsed();
            parse_quote! {
                {
                    let started = self.started;
                    ::tracing::#event!(function = #name, elapsed = %#elapsed, "exit");
                }
            }
        }
        None => parse_quote! { ::tracing::#event!(function = #name, "exit"); },
    };

    let prologue: Vec<Stmt> = parse_quote! {
        struct __TracedGuard {
            started: ::std::time::Instant,
        }

        impl ::std::ops::Drop for __TracedGuard {
            fn drop(&mut self) {
                #on_exit
            }
        }

        #warnings
        ::tracing::#event!(function = #name, "enter");
        let __traced_guard = __TracedGuard {
            started: ::std::time::Instant::now(),
        };
    };

    let body = std::mem::take(&mut item_fn.block.stmts);
    item_fn.block.stmts = prologue.into_iter().chain(body).collect();

    proc_macro::TokenStream::from(quote! { #item_fn })
}
