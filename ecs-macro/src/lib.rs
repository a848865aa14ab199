use proc_macro::TokenStream;
use quote::quote;
use syn::{DeriveInput, LitStr, parse_macro_input};

/// Derive the `Component` trait.
///
/// The registered name defaults to the type name and can be overridden with
/// `#[component(name = "...")]`. Prototype files refer to components by this name.
///
/// ```ignore
/// #[derive(Default, Component)]
/// #[component(name = "Health")]
/// struct HealthComponent {
///     current: f32,
///     max: f32,
/// }
/// ```
#[proc_macro_derive(Component, attributes(component))]
pub fn derive_component(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let mut registered_name = name.to_string();
    for attr in input.attrs.iter().filter(|a| a.path().is_ident("component")) {
        let parsed = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                let value: LitStr = meta.value()?.parse()?;
                registered_name = value.value();
                Ok(())
            } else {
                Err(meta.error("unsupported component attribute, expected `name`"))
            }
        });
        if let Err(err) = parsed {
            return err.to_compile_error().into();
        }
    }

    let expanded = quote! {
        impl #impl_generics orrery_ecs::Component for #name #ty_generics #where_clause {
            const NAME: &'static str = #registered_name;
        }
    };

    TokenStream::from(expanded)
}

/// Derive the `Event` trait.
///
/// Events are dispatched by value unless marked with `#[event(by_ref)]`, in which
/// case handlers receive a mutable view shared along the dispatch chain.
///
/// ```ignore
/// #[derive(Event)]
/// #[event(by_ref)]
/// struct DamageEvent {
///     amount: f32,
/// }
/// ```
#[proc_macro_derive(Event, attributes(event))]
pub fn derive_event(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let mut by_ref = false;
    for attr in input.attrs.iter().filter(|a| a.path().is_ident("event")) {
        let parsed = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("by_ref") {
                by_ref = true;
                Ok(())
            } else {
                Err(meta.error("unsupported event attribute, expected `by_ref`"))
            }
        });
        if let Err(err) = parsed {
            return err.to_compile_error().into();
        }
    }

    let shape: proc_macro2::TokenStream = if by_ref {
        quote! { orrery_ecs::DispatchShape::ByRef }
    } else {
        quote! { orrery_ecs::DispatchShape::ByValue }
    };

    let expanded = quote! {
        impl #impl_generics orrery_ecs::Event for #name #ty_generics #where_clause {
            const SHAPE: orrery_ecs::DispatchShape = #shape;
        }
    };

    TokenStream::from(expanded)
}
