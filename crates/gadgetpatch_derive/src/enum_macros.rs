use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Data, DeriveInput, Error, Fields, LitStr, Result, Variant};

pub(crate) fn expand_enum_choice(input: &DeriveInput) -> Result<TokenStream2> {
    let ident = &input.ident;

    let variants = match &input.data {
        Data::Enum(data) => &data.variants,
        _ => {
            return Err(Error::new_spanned(
                ident,
                "EnumChoice can only be derived for enums",
            ));
        }
    };

    let mut idents = Vec::with_capacity(variants.len());
    let mut names = Vec::with_capacity(variants.len());

    for variant in variants {
        if !matches!(variant.fields, Fields::Unit) {
            return Err(Error::new_spanned(
                variant,
                "EnumChoice variants cannot carry data",
            ));
        }

        let name = choice_name(variant)?
            .unwrap_or_else(|| variant.ident.to_string().to_lowercase());

        idents.push(&variant.ident);
        names.push(name);
    }

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics #ident #ty_generics #where_clause {
            pub const VARIANTS: &'static [Self] = &[#(Self::#idents),*];

            pub fn name(&self) -> &'static str {
                match self {
                    #(Self::#idents => #names),*
                }
            }
        }

        impl #impl_generics ::std::fmt::Display for #ident #ty_generics #where_clause {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.pad(self.name())
            }
        }
    })
}

fn choice_name(variant: &Variant) -> Result<Option<String>> {
    let mut name = None;

    for attr in variant.attrs.iter().filter(|a| a.path().is_ident("choice")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                let value: LitStr = meta.value()?.parse()?;
                name = Some(value.value());
                Ok(())
            } else {
                Err(meta.error("unsupported choice attribute, expected `name`"))
            }
        })?;
    }

    Ok(name)
}
