// These lints are triggered by darling's generated code for
// `#[darling(default)]`.
#![allow(clippy::option_if_let_else)]
#![allow(clippy::needless_continue)]

use darling::FromDeriveInput;
use heck::ToSnakeCase;
use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{DeriveInput, Ident, Path, parse_macro_input};

/// Configuration for the `#[event(...)]` attribute.
#[derive(Debug, FromDeriveInput)]
#[darling(attributes(event), supports(struct_any))]
struct EventArgs {
    ident: Ident,
    generics: syn::Generics,
    aggregate: String,
    #[darling(default)]
    kind: Option<String>,
    /// `fn(&Self) -> Vec<UniqueConstraint>`
    #[darling(default)]
    unique: Option<Path>,
}

/// Event type derived from the struct name.
///
/// `UserPasswordChanged` on aggregate `user` becomes `user.password.changed`:
/// the snake-cased name loses the aggregate prefix and `_` turns into `.`.
fn default_kind(ident: &Ident, aggregate: &str) -> String {
    let name = ident.to_string().to_snake_case();
    let prefix = format!("{}_", aggregate.replace(['.', '-'], "_"));
    let action = name.strip_prefix(&prefix).unwrap_or(&name);
    format!("{aggregate}.{}", action.replace('_', "."))
}

/// Parse derive input with darling and render errors as tokens.
fn parse_or_error<T, F>(input: &DeriveInput, f: F) -> TokenStream2
where
    T: FromDeriveInput,
    F: FnOnce(T) -> TokenStream2,
{
    match T::from_derive_input(input) {
        Ok(args) => f(args),
        Err(err) => err.write_errors(),
    }
}

/// Derives the `DomainEvent` trait for a struct.
///
/// The struct must also implement `serde::Serialize` and
/// `serde::Deserialize`; its serialized form is the stored payload.
///
/// # Attributes
///
/// ## Required
/// - `aggregate = "name"` - Aggregate type the event belongs to
///
/// ## Optional
/// - `kind = "name"` - Event type (default: `{aggregate}.{action}`, where the
///   action is the snake-cased struct name without the aggregate prefix and
///   with `_` replaced by `.`)
/// - `unique = path` - Function `fn(&Self) -> Vec<UniqueConstraint>` returning
///   the unique constraints to apply with the event
///
/// # Example
///
/// ```ignore
/// #[derive(Serialize, Deserialize, DomainEvent)]
/// #[event(aggregate = "user", unique = Self::claim_username)]
/// pub struct UserAdded {
///     username: String,
/// }
///
/// impl UserAdded {
///     fn claim_username(&self) -> Vec<UniqueConstraint> {
///         vec![UniqueConstraint::add("username", &self.username, "Errors.User.Taken")]
///     }
/// }
///
/// assert_eq!(UserAdded::EVENT_TYPE, "user.added");
/// ```
#[proc_macro_derive(DomainEvent, attributes(event))]
pub fn derive_domain_event(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    derive_domain_event_impl(&input).into()
}

/// Internal entry point that returns tokens for the event derive.
fn derive_domain_event_impl(input: &DeriveInput) -> TokenStream2 {
    parse_or_error::<EventArgs, _>(input, |args| generate_domain_event_impl(args, input))
}

/// Generate the event derive implementation tokens.
fn generate_domain_event_impl(args: EventArgs, input: &DeriveInput) -> TokenStream2 {
    if args.aggregate.is_empty() {
        return darling::Error::custom("aggregate must not be empty")
            .with_span(&input.ident)
            .write_errors();
    }
    if args.kind.as_deref() == Some("") {
        return darling::Error::custom("kind must not be empty")
            .with_span(&input.ident)
            .write_errors();
    }

    let ident = &args.ident;
    let aggregate = &args.aggregate;
    let kind = args
        .kind
        .clone()
        .unwrap_or_else(|| default_kind(ident, aggregate));
    let (impl_generics, ty_generics, where_clause) = args.generics.split_for_impl();

    let unique = args.unique.as_ref().map(|path| {
        quote! {
            fn unique_constraints(&self) -> ::std::vec::Vec<::keel::unique::UniqueConstraint> {
                #path(self)
            }
        }
    });

    quote! {
        impl #impl_generics ::keel::event::DomainEvent for #ident #ty_generics #where_clause {
            const AGGREGATE_TYPE: &'static str = #aggregate;
            const EVENT_TYPE: &'static str = #kind;

            #unique
        }
    }
}
