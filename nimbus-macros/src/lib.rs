use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields};

/// Derives `OptionSchema` for a struct with named fields, generating the
/// static list of recognised option keys.
///
/// # Usage
///
/// ```ignore
/// #[derive(Deserialize, PluginOptions)]
/// struct CoreOptions {
///     /// Path to the worker script
///     #[option(kind = Path, from_config = extract_script_path)]
///     script_path: Option<PathBuf>,
///
///     #[option(kind = Boolean)]
///     watch: Option<bool>,
///
///     #[option(skip)]
///     internal: Option<String>,
/// }
/// ```
///
/// Every field becomes one entry keyed by the field name (or
/// `#[option(rename = "key")]`). The entry's description is the field's doc
/// comment. `kind` names an `OptionKind` variant and defaults to `Any`;
/// `from_config` names a `ConfigExtractor` function.
#[proc_macro_derive(PluginOptions, attributes(option))]
pub fn derive_plugin_options(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand(input: DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let struct_name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(named) => &named.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    struct_name,
                    "PluginOptions requires a struct with named fields",
                ))
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                struct_name,
                "PluginOptions can only be derived for structs",
            ))
        }
    };

    let mut entries = Vec::new();
    for field in fields {
        let attrs = FieldAttrs::parse(&field.attrs)?;
        if attrs.skip {
            continue;
        }

        let key = match attrs.rename {
            Some(key) => key,
            None => match &field.ident {
                Some(ident) => ident.to_string().trim_start_matches("r#").to_string(),
                None => continue,
            },
        };
        let kind = attrs
            .kind
            .unwrap_or_else(|| syn::Ident::new("Any", proc_macro2::Span::call_site()));
        let description = doc_comment(&field.attrs);
        let from_config = match attrs.from_config {
            Some(path) => quote! {
                ::std::option::Option::Some(#path as ::nimbus_plugin_api::ConfigExtractor)
            },
            None => quote! { ::std::option::Option::None },
        };

        entries.push(quote! {
            ::nimbus_plugin_api::OptionMeta {
                key: #key,
                kind: ::nimbus_plugin_api::OptionKind::#kind,
                description: #description,
                from_config: #from_config,
            }
        });
    }

    Ok(quote! {
        impl #impl_generics ::nimbus_plugin_api::OptionSchema for #struct_name #ty_generics #where_clause {
            fn option_schema() -> ::std::vec::Vec<::nimbus_plugin_api::OptionMeta> {
                ::std::vec![#(#entries),*]
            }
        }
    })
}

#[derive(Default)]
struct FieldAttrs {
    kind: Option<syn::Ident>,
    from_config: Option<syn::Path>,
    rename: Option<String>,
    skip: bool,
}

impl FieldAttrs {
    /// Parse every #[option(...)] attribute on a field
    fn parse(attrs: &[syn::Attribute]) -> syn::Result<Self> {
        let mut parsed = Self::default();
        for attr in attrs {
            if !attr.path().is_ident("option") {
                continue;
            }
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("kind") {
                    parsed.kind = Some(meta.value()?.parse()?);
                    Ok(())
                } else if meta.path.is_ident("from_config") {
                    parsed.from_config = Some(meta.value()?.parse()?);
                    Ok(())
                } else if meta.path.is_ident("rename") {
                    let key: syn::LitStr = meta.value()?.parse()?;
                    parsed.rename = Some(key.value());
                    Ok(())
                } else if meta.path.is_ident("skip") {
                    parsed.skip = true;
                    Ok(())
                } else {
                    Err(meta.error("expected `kind`, `from_config`, `rename` or `skip`"))
                }
            })?;
        }
        Ok(parsed)
    }
}

/// Joins the `///` lines of a field into one description
fn doc_comment(attrs: &[syn::Attribute]) -> String {
    let lines: Vec<String> = attrs
        .iter()
        .filter(|attr| attr.path().is_ident("doc"))
        .filter_map(|attr| match &attr.meta {
            syn::Meta::NameValue(nv) => match &nv.value {
                syn::Expr::Lit(syn::ExprLit {
                    lit: syn::Lit::Str(text),
                    ..
                }) => Some(text.value().trim().to_string()),
                _ => None,
            },
            _ => None,
        })
        .filter(|line| !line.is_empty())
        .collect();
    lines.join(" ")
}
