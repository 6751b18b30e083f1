use std::any::type_name;

/// Last path segment of a type's name, for log messages.
pub fn pretty_type_name<'a, T>() -> &'a str {
    type_name::<T>().split("::").last().unwrap_or_default()
}
