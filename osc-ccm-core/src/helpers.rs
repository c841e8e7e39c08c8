/// Splits a comma separated annotation value, dropping empty entries
pub fn split_comma_list(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
}

#[cfg(test)]
mod tests {
    use super::split_comma_list;

    #[test]
    fn split_comma_list_trims_and_skips_empty_entries() {
        let entries = split_comma_list(" sg-1, ,sg-2,").collect::<Vec<_>>();

        assert_eq!(vec!["sg-1", "sg-2"], entries);
    }
}
