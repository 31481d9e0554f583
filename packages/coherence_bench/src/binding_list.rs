//! Ordered list syntax shared by `CPU_LIST`, `SHARED_CPU_LIST`, `MEM_BIND` and `PROBLEMLIST`.
//!
//! Unlike the kernel's cpulist format, the order of the items matters: the first CPU of
//! `CPU_LIST` becomes worker 0, the second worker 1 and so on. Each comma-separated part is one of:
//!
//! * `n` - a single item.
//! * `a-b` - every item from `a` to `b` inclusive.
//! * `a-b/s` or `a-b:s` - every `s`-th item from `a` to `b` inclusive.

use itertools::Itertools;

/// Upper bound on how many items a single list may expand to.
const MAX_ITEMS: usize = 1 << 20;

/// Parses an ordered list, keeping items in the order written, including any duplicates.
///
/// Empty parts (e.g. a trailing comma) are ignored.
pub(crate) fn parse_ordered(list: &str) -> Result<Vec<u64>, String> {
    let mut items = Vec::new();

    for part in list.split(',').map(str::trim) {
        if part.is_empty() {
            continue;
        }

        if let Some((range_start, rest)) = part.split_once('-') {
            parse_range(range_start, rest, &mut items)?;
        } else {
            items.push(parse_item(part, "item")?);
        }

        if items.len() > MAX_ITEMS {
            return Err(format!("list expands to more than {MAX_ITEMS} items"));
        }
    }

    Ok(items)
}

/// Parses an ordered CPU list. Duplicates are dropped, keeping the first occurrence, because a
/// processor can only host one worker.
pub(crate) fn parse_processors(list: &str) -> Result<Vec<u32>, String> {
    parse_ordered(list)?
        .into_iter()
        .unique()
        .map(|item| u32::try_from(item).map_err(|_| format!("processor {item} is out of range")))
        .collect()
}

fn parse_range(range_start: &str, rest: &str, items: &mut Vec<u64>) -> Result<(), String> {
    let range_start = parse_item(range_start, "range start")?;

    // If no stride is specified, we just default to 1 and pretend it was specified.
    let (range_end_inc, stride) = match rest.split_once(['/', ':']) {
        Some((range_end_inc, stride)) => (
            parse_item(range_end_inc, "range end")?,
            parse_item(stride, "range stride")?,
        ),
        None => (parse_item(rest, "range end")?, 1),
    };

    if stride == 0 {
        return Err(format!("range {range_start}-{range_end_inc} has a zero stride"));
    }

    if range_start > range_end_inc {
        return Err(format!(
            "range {range_start}-{range_end_inc} must not end before it starts"
        ));
    }

    let stride = usize::try_from(stride).unwrap_or(usize::MAX);
    items.extend((range_start..=range_end_inc).step_by(stride).take(MAX_ITEMS + 1));

    Ok(())
}

fn parse_item(text: &str, what: &str) -> Result<u64, String> {
    text.trim()
        .parse::<u64>()
        .map_err(|e| format!("{what} '{text}' is not a non-negative integer: {e}"))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn keeps_written_order() {
        assert_eq!(parse_ordered("").unwrap(), Vec::<u64>::new());
        assert_eq!(parse_ordered("3,1,2").unwrap(), vec![3, 1, 2]);
        assert_eq!(parse_ordered("4-6,0").unwrap(), vec![4, 5, 6, 0]);
        assert_eq!(parse_ordered("0-10/4").unwrap(), vec![0, 4, 8]);
        assert_eq!(parse_ordered("0-10:5,1").unwrap(), vec![0, 5, 10, 1]);
        assert_eq!(parse_ordered(" 7 , 8 ,").unwrap(), vec![7, 8]);
    }

    #[test]
    fn processors_are_deduplicated_keeping_first() {
        assert_eq!(parse_processors("2,0-3").unwrap(), vec![2, 0, 1, 3]);
    }

    #[test]
    fn malformed_lists_are_rejected() {
        parse_ordered("foo").unwrap_err();
        parse_ordered("1-foo").unwrap_err();
        parse_ordered("1-5/0").unwrap_err();
        parse_ordered("5-1").unwrap_err();
        parse_ordered("1-5/x").unwrap_err();
        parse_ordered("-1").unwrap_err();
    }

    #[test]
    fn oversized_expansion_is_rejected() {
        parse_ordered("0-100000000").unwrap_err();
    }

    #[test]
    fn processor_out_of_u32_range_is_rejected() {
        parse_processors("4294967296").unwrap_err();
    }
}
