//! Macros for reducing event construction boilerplate.

/// Build an [`Event`](crate::Event) from a name, positional arguments and
/// keyword arguments. Every value goes through `serde_json::json!`.
///
/// # Example
///
/// ```ignore
/// use switchboard_core::event;
///
/// let e = event!(Hello, "world", [1, 2]; shout = true, times = 3);
/// assert_eq!(e.name(), "Hello");
/// assert_eq!(e[0], "world");
/// assert_eq!(e["times"], 3);
///
/// // Names that are not identifiers:
/// let e = event!("task-done", 42);
/// ```
#[macro_export]
macro_rules! event {
    (@build $name:expr $(, $arg:expr)* $(; $($key:ident = $value:expr),+)?) => {{
        #[allow(unused_mut)]
        let mut event = $crate::Event::new($name);
        $( event.args.push($crate::__private::serde_json::json!($arg)); )*
        $($(
            event.kwargs.insert(
                ::std::string::String::from(stringify!($key)),
                $crate::__private::serde_json::json!($value),
            );
        )+)?
        event
    }};
    ($name:literal $(, $arg:expr)* $(; $($key:ident = $value:expr),+)?) => {
        $crate::event!(@build $name $(, $arg)* $(; $($key = $value),+)?)
    };
    ($name:ident $(, $arg:expr)* $(; $($key:ident = $value:expr),+)?) => {
        $crate::event!(@build stringify!($name) $(, $arg)* $(; $($key = $value),+)?)
    };
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    #[test]
    fn builds_positional_and_keyword_payload() {
        let e = event!(Hello, "world", [1, 2]; shout = true, times = 3);
        assert_eq!(e.name(), "Hello");
        assert_eq!(e.args, vec![json!("world"), json!([1, 2])]);
        assert_eq!(e["shout"], json!(true));
        assert_eq!(e["times"], json!(3));
    }

    #[test]
    fn accepts_literal_names_and_empty_payloads() {
        let e = event!("task-done");
        assert_eq!(e.name(), "task-done");
        assert!(e.args.is_empty() && e.kwargs.is_empty());

        let n = 5;
        let e = event!(Count, n * 2);
        assert_eq!(e[0], json!(10));
    }
}
