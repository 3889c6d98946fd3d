use crate::utils::{apply_derives, has_field_named, prepend_field};
use proc_macro::TokenStream;
use quote::quote;
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::{Expr, Ident, Item, Result, Token, parse::Parse, parse::ParseStream, parse_macro_input};

/// #[integration_event] 宏实现
/// - 仅支持具名字段结构体
/// - 缺失时在最前追加 `#[serde(flatten)] pub meta: EventMeta`
/// - 合并派生：Debug, Clone, PartialEq, Serialize, Deserialize
/// - 生成 `::event_bus::event::IntegrationEvent` 实现；事件名默认为结构体名，
///   可通过 `#[integration_event(name = "...")]` 覆写
pub(crate) fn expand(attr: TokenStream, item: TokenStream) -> TokenStream {
    let cfg = parse_macro_input!(attr as IntegrationEventAttrConfig);
    let mut input = parse_macro_input!(item as Item);

    let st = match &mut input {
        Item::Struct(st) => st,
        other => {
            return syn::Error::new(
                other.span(),
                "#[integration_event] can only be used on named-field structs",
            )
            .to_compile_error()
            .into();
        }
    };

    let fields = match &mut st.fields {
        syn::Fields::Named(fields) => fields,
        other => {
            return syn::Error::new(
                other.span(),
                "#[integration_event] supports only named-field structs, e.g., struct E { x: T }",
            )
            .to_compile_error()
            .into();
        }
    };

    if !has_field_named(fields, "meta") {
        prepend_field(
            fields,
            syn::parse_quote! {
                #[serde(flatten)]
                pub meta: ::event_bus::event::EventMeta
            },
        );
    }

    apply_derives(
        &mut st.attrs,
        vec![
            syn::parse_quote!(Debug),
            syn::parse_quote!(Clone),
            syn::parse_quote!(PartialEq),
            syn::parse_quote!(serde::Serialize),
            syn::parse_quote!(serde::Deserialize),
        ],
    );

    let ident = &st.ident;
    let name = cfg
        .name
        .unwrap_or_else(|| syn::LitStr::new(&ident.to_string(), ident.span()));
    let (impl_generics, ty_generics, where_clause) = st.generics.split_for_impl();

    let out = quote! {
        #st

        impl #impl_generics ::event_bus::event::IntegrationEvent for #ident #ty_generics #where_clause {
            fn event_name() -> &'static str {
                #name
            }

            fn meta(&self) -> &::event_bus::event::EventMeta {
                &self.meta
            }
        }
    };

    TokenStream::from(out)
}

// -------- parsing --------

// 解析宏参数：name = "..."
struct IntegrationEventAttrConfig {
    name: Option<syn::LitStr>,
}

impl Parse for IntegrationEventAttrConfig {
    fn parse(input: ParseStream) -> Result<Self> {
        let mut name: Option<syn::LitStr> = None;
        if input.is_empty() {
            return Ok(Self { name });
        }

        let pairs: Punctuated<AttrKv, Token![,]> = Punctuated::parse_terminated(input)?;
        for kv in pairs {
            match kv.key.to_string().as_str() {
                "name" => {
                    if name.is_some() {
                        return Err(syn::Error::new(
                            kv.key.span(),
                            "duplicate key 'name' in attribute",
                        ));
                    }
                    let lit = match kv.value {
                        Expr::Lit(syn::ExprLit {
                            lit: syn::Lit::Str(lit),
                            ..
                        }) => lit,
                        other => {
                            return Err(syn::Error::new(
                                other.span(),
                                "expected string literal for 'name'",
                            ));
                        }
                    };
                    if lit.value().trim().is_empty() {
                        return Err(syn::Error::new(lit.span(), "event name must not be empty"));
                    }
                    name = Some(lit);
                }
                _ => {
                    return Err(syn::Error::new(
                        kv.key.span(),
                        "unknown key; expected 'name'",
                    ));
                }
            }
        }

        Ok(Self { name })
    }
}

struct AttrKv {
    key: Ident,
    value: Expr,
}

impl Parse for AttrKv {
    fn parse(input: ParseStream) -> Result<Self> {
        let key: Ident = input.parse()?;
        let _eq: Token![=] = input.parse()?;
        let value: Expr = input.parse()?;
        Ok(Self { key, value })
    }
}
