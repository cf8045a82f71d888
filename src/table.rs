//! Plain-text tables in reStructuredText "simple table" layout.

const COLUMN_GAP: &str = "  ";

/// Render `rows` under `headers`. Cells may span several lines.
pub fn render_rst<S: AsRef<str>>(headers: &[S], rows: &[Vec<String>]) -> String {
    let columns = headers.len();
    let mut widths: Vec<usize> = headers.iter().map(|header| header.as_ref().chars().count()).collect();
    for row in rows {
        for (idx, cell) in row.iter().take(columns).enumerate() {
            let cell_width = cell.lines().map(|line| line.chars().count()).max().unwrap_or(0);
            widths[idx] = widths[idx].max(cell_width);
        }
    }

    let rule = widths.iter().map(|width| "=".repeat(*width)).collect::<Vec<_>>().join(COLUMN_GAP);
    let mut out = Vec::new();
    out.push(rule.clone());
    out.push(render_line(&widths, headers.iter().map(|header| header.as_ref())));
    out.push(rule.clone());
    for row in rows {
        let cells: Vec<Vec<&str>> = (0..columns)
            .map(|idx| row.get(idx).map(|cell| cell.lines().collect()).unwrap_or_default())
            .collect();
        let height = cells.iter().map(Vec::len).max().unwrap_or(0).max(1);
        for line in 0..height {
            out.push(render_line(
                &widths,
                cells.iter().map(|cell| cell.get(line).copied().unwrap_or("")),
            ));
        }
    }
    out.push(rule);
    out.join("\n")
}

fn render_line<'a>(widths: &[usize], cells: impl Iterator<Item = &'a str>) -> String {
    let line = cells
        .zip(widths.iter().copied())
        .map(|(cell, width)| format!("{cell:<width$}"))
        .collect::<Vec<_>>()
        .join(COLUMN_GAP);
    line.trim_end().to_string()
}

/// Greedy word wrap to at most `width` characters per line.
pub fn wrap(text: &str, width: usize) -> String {
    let width = width.max(1);
    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        // Words wider than a line are split across lines.
        while word.len() > width {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            let rest = word.split_off(width);
            lines.push(word.into_iter().collect());
            word = rest;
        }
        let word: String = word.into_iter().collect();
        if current.is_empty() {
            current = word;
        } else if current.chars().count() + 1 + word.chars().count() <= width {
            current.push(' ');
            current.push_str(&word);
        } else {
            lines.push(std::mem::replace(&mut current, word));
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_simple_table() {
        let table = render_rst(
            &["container_id", "container_status", "command"],
            &[vec!["0123456789ab".into(), "running".into(), "dino train -e spec.yaml".into()]],
        );
        let expected = "\
============  ================  =======================
container_id  container_status  command
============  ================  =======================
0123456789ab  running           dino train -e spec.yaml
============  ================  =======================";
        assert_eq!(table, expected);
    }

    #[test]
    fn renders_multiline_cells() {
        let table = render_rst(&["id", "command"], &[vec!["a".into(), "one\ntwo".into()]]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[3], "a   one");
        assert_eq!(lines[4], "    two");
        assert_eq!(lines.len(), 6);
    }

    #[test]
    fn wraps_on_word_boundaries() {
        assert_eq!(wrap("detectnet_v2 train -e /specs/train.txt", 20), "detectnet_v2 train\n-e /specs/train.txt");
        assert_eq!(wrap("abcdefgh", 3), "abc\ndef\ngh");
        assert_eq!(wrap("", 10), "");
    }
}
