/// Return the first element of `prefs` that also appears in `avail`.
pub fn first_in_both<T: Clone + PartialEq>(prefs: &[T], avail: &[T]) -> Option<T> {
  prefs.iter().find(|x| avail.contains(x)).cloned()
}

/// Case-insensitive ASCII equality, for host name comparison.
pub fn eq_ignore_ascii_case(a: &[u8], b: &[u8]) -> bool {
  a.len() == b.len()
    && a.iter()
      .zip(b.iter())
      .all(|(x, y)| x.to_ascii_lowercase() == y.to_ascii_lowercase())
}

#[cfg(test)]
mod test {
  #[test]
  fn first_in_both_prefers_lhs_order() {
    assert_eq!(super::first_in_both(&[1, 2, 3], &[3, 2]), Some(2));
    assert_eq!(super::first_in_both::<u8>(&[1], &[2]), None);
  }

  #[test]
  fn hostname_compare() {
    assert!(super::eq_ignore_ascii_case(b"Example.COM", b"example.com"));
    assert!(!super::eq_ignore_ascii_case(b"example.org", b"example.com"));
  }
}
