//! Proc macros for switchboard response types.
//!
//! Current list (see function docs for details):
//!   - [`http_status_code_derive`] (for `#[derive(HttpStatusCode)]`)

use attribute_derive::FromAttr;
use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::spanned::Spanned;
use syn::{parse_macro_input, Data, DeriveInput, Fields};

// --- #[derive(HttpStatusCode)] -------------------------------------------------------------------

/// Attach an HTTP status code to each variant of a response enum, or to a
/// whole response struct.
///
/// Syntax:
///
/// ```rs
/// use serde::{Serialize, Deserialize};
/// use corral_switchboard_macros::HttpStatusCode;
///
/// #[derive(HttpStatusCode, Serialize, Deserialize)]
/// enum PollResponse {
///     #[http(status = 200)]
///     Ok { job: Option<Job> },
///     #[http(status = 401)]
///     Unauthorized,
///     #[http(status = 500)]
///     Internal,
/// }
///
/// #[derive(HttpStatusCode, Serialize, Deserialize)]
/// #[http(status = 200)]
/// struct Acknowledged {
///     ok: bool,
/// }
/// ```
///
/// The generated impl targets `corral_switchboard_traits::JsonProxiedStatus`,
/// and the expansion refers to `http::StatusCode`, so the using crate needs
/// both in scope as dependencies.
#[proc_macro_derive(HttpStatusCode, attributes(http))]
pub fn http_status_code_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    expand_http_status_code_derive(input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

#[derive(FromAttr)]
#[attribute(ident = http)]
#[attribute(error(missing_field = "`{field}` was not specified"))]
struct HttpAttrs {
    #[attribute(example = "#[http(status = 404)")]
    status: u16,
}

fn check_status(status: u16, span: proc_macro2::Span) -> syn::Result<()> {
    // Mirrors http::StatusCode::from_u16, so that a bad code is a compile error
    // instead of a panic on the first response.
    if (100..1000).contains(&status) {
        Ok(())
    } else {
        Err(syn::Error::new(
            span,
            format!("{status} is not a valid HTTP status code (expected 100..=999)"),
        ))
    }
}

// Inner function so that it's easier to wrap it with Error::into_compile_error
fn expand_http_status_code_derive(input: DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = input.ident.clone();
    let trait_name = quote! { corral_switchboard_traits::JsonProxiedStatus };

    let body = match input.data {
        Data::Enum(numer) => {
            let mut status_code_match_arms = vec![];
            for variant in numer.variants {
                let attrs = HttpAttrs::from_attributes(&variant.attrs)?;
                check_status(attrs.status, variant.span())?;
                let variant_ident = variant.ident;
                let variant_value = attrs.status;
                let variant_fields = match &variant.fields {
                    Fields::Named(_) => quote!({ .. }),
                    Fields::Unnamed(_) => quote!((..)),
                    Fields::Unit => quote!(),
                };
                status_code_match_arms.push(quote! {
                    Self::#variant_ident #variant_fields => #variant_value
                });
            }
            quote! {
                let code: u16 = match self {
                    #(#status_code_match_arms),*
                };
            }
        }
        Data::Struct(_) => {
            let attrs = HttpAttrs::from_attributes(&input.attrs)?;
            check_status(attrs.status, input.span())?;
            let value = attrs.status;
            quote! {
                let code: u16 = #value;
            }
        }
        Data::Union(_) => {
            return Err(syn::Error::new(
                input.span(),
                "#[derive(HttpStatusCode)] only works on enums and structs.",
            ));
        }
    };

    let name_test = format_ident!("__{name}_http_status_tests");

    let output = quote! {
        impl #trait_name for #name {
            fn status_code(&self) -> http::StatusCode {
                #body
                // Range checked at expansion time.
                http::StatusCode::from_u16(code).unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
        #[cfg(test)]
        #[allow(non_snake_case)]
        mod #name_test {
            #[test]
            fn derives_http_status_impl() {
                fn assert_impl<T: #trait_name>() {}
                assert_impl::<super::#name>();
            }
        }
    };

    Ok(output)
}
