#![allow(non_snake_case)]

use proc_macro::*;
use syn::{DeriveInput, parse_macro_input};

mod enum_macros;

/// Derives `Display`, `name()` and a `VARIANTS` table for a fieldless enum.
///
/// Variants display as their lowercased identifier unless renamed with
/// `#[choice(name = "...")]`.
#[proc_macro_derive(EnumChoice, attributes(choice))]
pub fn derive_enum_choice(input: TokenStream) -> TokenStream {
    let derive_input = parse_macro_input!(input as DeriveInput);

    match enum_macros::expand_enum_choice(&derive_input) {
        Ok(expanded) => TokenStream::from(expanded),
        Err(err) => TokenStream::from(err.to_compile_error()),
    }
}
