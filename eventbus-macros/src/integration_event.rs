use crate::utils::{apply_derives, prepend_missing_fields};
use proc_macro::TokenStream;
use quote::quote;
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::{
    Field, Item, LitStr, Result, Token, parse::Parse, parse::ParseStream, parse_macro_input,
};

const ENVELOPE_FIELDS: [&str; 2] = ["id", "creation_date"];

/// #[integration_event] 宏实现
pub(crate) fn expand(attr: TokenStream, item: TokenStream) -> TokenStream {
    let cfg = parse_macro_input!(attr as EventAttrConfig);
    let input = parse_macro_input!(item as Item);

    let mut st = match input {
        Item::Struct(s) => s,
        other => {
            return syn::Error::new(other.span(), "#[integration_event] only on struct")
                .to_compile_error()
                .into();
        }
    };

    let vis = st.vis.clone();
    let span = st.span();

    // 仅支持具名字段结构体
    let syn::Fields::Named(fields_named) = &mut st.fields else {
        return syn::Error::new(span, "only supports named-field struct")
            .to_compile_error()
            .into();
    };

    let envelope: Vec<Field> = vec![
        syn::parse_quote! {
            #[serde(rename = "Id")]
            #vis id: ::eventbus::uuid::Uuid
        },
        syn::parse_quote! {
            #[serde(rename = "CreationDate")]
            #vis creation_date: ::eventbus::chrono::DateTime<::eventbus::chrono::Utc>
        },
    ];
    let added = prepend_missing_fields(fields_named, envelope);

    // 构造函数参数：除信封字段外的其余字段，保持声明顺序
    let (arg_idents, arg_types): (Vec<_>, Vec<_>) = fields_named
        .named
        .iter()
        .filter_map(|f| {
            let ident = f.ident.as_ref()?;
            if ENVELOPE_FIELDS.iter().any(|n| ident == n) {
                None
            } else {
                Some((ident.clone(), f.ty.clone()))
            }
        })
        .unzip();

    apply_derives(
        &mut st.attrs,
        vec![
            syn::parse_quote!(Debug),
            syn::parse_quote!(Clone),
            syn::parse_quote!(serde::Serialize),
            syn::parse_quote!(serde::Deserialize),
        ],
    );

    let ident = &st.ident;
    let (impl_generics, ty_generics, where_clause) = st.generics.split_for_impl();
    let event_name = cfg
        .name
        .unwrap_or_else(|| LitStr::new(&ident.to_string(), ident.span()));

    let constructor = if cfg.constructor.unwrap_or(true) && added.len() == ENVELOPE_FIELDS.len() {
        quote! {
            impl #impl_generics #ident #ty_generics #where_clause {
                /// 以新的事件标识与当前 UTC 时间创建事件
                #vis fn new(#(#arg_idents: #arg_types),*) -> Self {
                    Self {
                        id: ::eventbus::uuid::Uuid::new_v4(),
                        creation_date: ::eventbus::chrono::Utc::now(),
                        #(#arg_idents),*
                    }
                }
            }
        }
    } else {
        quote! {}
    };

    let expanded = quote! {
        #st

        impl #impl_generics ::eventbus::IntegrationEvent for #ident #ty_generics #where_clause {
            const EVENT_NAME: &'static str = #event_name;

            fn id(&self) -> ::eventbus::uuid::Uuid {
                self.id
            }

            fn creation_date(&self) -> ::eventbus::chrono::DateTime<::eventbus::chrono::Utc> {
                self.creation_date
            }
        }

        #constructor
    };

    TokenStream::from(expanded)
}

// -------- parsing --------

struct EventAttrConfig {
    name: Option<LitStr>,
    constructor: Option<bool>,
}

impl Parse for EventAttrConfig {
    fn parse(input: ParseStream) -> Result<Self> {
        let mut name: Option<LitStr> = None;
        let mut constructor: Option<bool> = None;

        let elems: Punctuated<EventAttrElem, Token![,]> =
            Punctuated::<EventAttrElem, Token![,]>::parse_terminated(input)?;

        for elem in elems.into_iter() {
            match elem {
                EventAttrElem::Name(lit) => {
                    if name.is_some() {
                        return Err(syn::Error::new(lit.span(), "duplicate key 'name' in attribute"));
                    }
                    if lit.value().is_empty() {
                        return Err(syn::Error::new(lit.span(), "event name must not be empty"));
                    }
                    name = Some(lit);
                }
                EventAttrElem::Constructor(b) => {
                    if constructor.is_some() {
                        return Err(syn::Error::new(
                            b.span(),
                            "duplicate key 'constructor' in attribute",
                        ));
                    }
                    constructor = Some(b.value());
                }
            }
        }

        Ok(Self { name, constructor })
    }
}

enum EventAttrElem {
    Name(LitStr),
    Constructor(syn::LitBool),
}

impl Parse for EventAttrElem {
    fn parse(input: ParseStream) -> Result<Self> {
        let key: syn::Ident = input.parse()?;
        let _eq: Token![=] = input.parse()?;
        if key == "name" {
            Ok(EventAttrElem::Name(input.parse()?))
        } else if key == "constructor" {
            Ok(EventAttrElem::Constructor(input.parse()?))
        } else {
            Err(syn::Error::new(
                key.span(),
                "unknown key in attribute; expected 'name' or 'constructor'",
            ))
        }
    }
}
