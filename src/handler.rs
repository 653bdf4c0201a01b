//! The handler a request was dispatched to, and how it names the
//! transaction.
//!
//! Adapters find the handler in the response extensions (set by the handler
//! or the router after resolution) or, failing that, in the request
//! extensions.

use std::{any::type_name, borrow::Cow};

/// Method name function-style handlers are recognized by.
pub const HANDLE_METHOD: &str = "handle";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handler {
    /// A method declared on a controller-like type.
    Method(HandlerMethod),
    /// A callable object that exposes a set of methods, one of them
    /// [`HANDLE_METHOD`].
    Function(HandlerFunction),
    /// Anything else. Leaves the transaction name alone.
    Opaque { type_name: Cow<'static, str> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerMethod {
    pub declaring_type: Cow<'static, str>,
    pub method: Cow<'static, str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFunction {
    pub type_name: Cow<'static, str>,
    /// Exposed methods in declaration order.
    pub methods: Vec<MethodInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub name: Cow<'static, str>,
    pub declaring_type: Cow<'static, str>,
}

impl MethodInfo {
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        declaring_type: impl Into<Cow<'static, str>>,
    ) -> Self {
        MethodInfo {
            name: name.into(),
            declaring_type: declaring_type.into(),
        }
    }
}

impl Handler {
    /// Method `method` declared on `T`.
    pub fn method<T: ?Sized>(method: &'static str) -> Self {
        Self::method_named(type_name::<T>(), method)
    }

    pub fn method_named(
        declaring_type: impl Into<Cow<'static, str>>,
        method: impl Into<Cow<'static, str>>,
    ) -> Self {
        Handler::Method(HandlerMethod {
            declaring_type: declaring_type.into(),
            method: method.into(),
        })
    }

    /// A function-style handler whose single `handle` method is declared on
    /// `F`, typically the handler closure or function itself.
    pub fn function<F: ?Sized>() -> Self {
        let type_name = type_name::<F>();
        Self::function_with_methods(type_name, vec![MethodInfo::new(HANDLE_METHOD, type_name)])
    }

    pub fn function_with_methods(
        type_name: impl Into<Cow<'static, str>>,
        methods: Vec<MethodInfo>,
    ) -> Self {
        Handler::Function(HandlerFunction {
            type_name: type_name.into(),
            methods,
        })
    }

    pub fn opaque<T: ?Sized>() -> Self {
        Handler::Opaque {
            type_name: type_name::<T>().into(),
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            Handler::Method(method) => &method.declaring_type,
            Handler::Function(function) => &function.type_name,
            Handler::Opaque { type_name } => type_name,
        }
    }

    /// `<simple type name>#<method>` for method handlers,
    /// `<simple declaring type>#handle` for function handlers, `None`
    /// otherwise.
    ///
    /// Every `handle` method of a function handler is visited in
    /// declaration order and the last one decides the name.
    pub fn transaction_name(&self) -> Option<String> {
        match self {
            Handler::Method(method) => Some(format!(
                "{}#{}",
                simple_name(&method.declaring_type),
                method.method
            )),
            Handler::Function(function) => function
                .methods
                .iter()
                .filter(|method| method.name == HANDLE_METHOD)
                .last()
                .map(|method| format!("{}#{}", simple_name(&method.declaring_type), method.name)),
            Handler::Opaque { .. } => None,
        }
    }
}

/// Last path segment of a type name, without generic arguments and
/// skipping compiler generated segments such as `{{closure}}`.
pub fn simple_name(type_name: &str) -> &str {
    let type_name = type_name.trim_start_matches('&');
    let path = match type_name.find('<') {
        Some(generics) if generics > 0 => &type_name[..generics],
        _ => type_name,
    };

    path.rsplit("::")
        .find(|segment| !segment.is_empty() && !segment.starts_with("{{"))
        .unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    struct WebfluxApplication;

    #[test]
    fn method_handlers_use_the_declaring_type() {
        let handler = Handler::method::<WebfluxApplication>("greeting");

        assert_eq!(
            handler.transaction_name().as_deref(),
            Some("WebfluxApplication#greeting")
        );
    }

    #[test]
    fn method_handlers_with_explicit_types() {
        let handler = Handler::method_named("Foo", "bar");

        assert_eq!(handler.transaction_name().as_deref(), Some("Foo#bar"));
    }

    #[test]
    fn function_handlers_use_the_handle_method() {
        let handler = Handler::function_with_methods(
            "app::routes::Baz",
            vec![
                MethodInfo::new("and_then", "app::routes::Baz"),
                MethodInfo::new(HANDLE_METHOD, "app::routes::Baz"),
            ],
        );

        assert_eq!(handler.transaction_name().as_deref(), Some("Baz#handle"));
    }

    #[test]
    fn last_handle_method_wins() {
        let handler = Handler::function_with_methods(
            "Derived",
            vec![
                MethodInfo::new(HANDLE_METHOD, "Base"),
                MethodInfo::new(HANDLE_METHOD, "Derived"),
            ],
        );

        assert_eq!(handler.transaction_name().as_deref(), Some("Derived#handle"));
    }

    #[test]
    fn function_handlers_without_handle_leave_the_name() {
        let handler =
            Handler::function_with_methods("Baz", vec![MethodInfo::new("call", "Baz")]);

        assert_eq!(handler.transaction_name(), None);
    }

    #[test]
    fn closures_are_named_after_their_enclosing_function() {
        fn route() -> impl Fn() {
            || {}
        }

        fn handler_of<F>(_: &F) -> Handler {
            Handler::function::<F>()
        }

        let handler = handler_of(&route());

        assert_eq!(handler.transaction_name().as_deref(), Some("route#handle"));
    }

    #[test]
    fn opaque_handlers_have_no_name() {
        let handler = Handler::opaque::<String>();

        assert_eq!(handler.transaction_name(), None);
        assert!(handler.type_name().ends_with("String"));
    }

    #[test]
    fn simple_names() {
        assert_eq!(simple_name("Foo"), "Foo");
        assert_eq!(simple_name("app::Foo"), "Foo");
        assert_eq!(simple_name("app::Wrapper<app::Inner>"), "Wrapper");
        assert_eq!(simple_name("&app::Foo"), "Foo");
        assert_eq!(simple_name("app::route::{{closure}}"), "route");
    }

    #[test]
    fn qualified_paths_keep_their_last_segment() {
        let declaring_type = "<app::Routes as app::Router>::Handler";
        let handler = Handler::function_with_methods(
            declaring_type,
            vec![MethodInfo::new(HANDLE_METHOD, declaring_type)],
        );

        assert_eq!(simple_name(declaring_type), "Handler");
        assert_eq!(
            handler.transaction_name().as_deref(),
            Some("Handler#handle")
        );
    }
}
