#[derive(Debug, Clone, Default)]
pub struct SourceMap {
    pub name: String,
    source: Vec<char>,
    line_indices: Vec<usize>,
}

impl SourceMap {
    pub fn new(source: String) -> Self {
        Self::from_source("script", source)
    }

    pub fn from_source(name: &str, source: String) -> Self {
        let chars: Vec<char> = source.chars().collect();
        let line_indices = chars
            .iter()
            .enumerate()
            .filter_map(|(i, c)| if *c == '\n' { Some(i) } else { None })
            .collect();

        Self {
            name: name.to_string(),
            source: chars,
            line_indices,
        }
    }

    pub fn get_source(&self) -> &[char] {
        &self.source
    }

    /// Returns the line number (1-based) for a given position in the source.
    pub fn get_line_number(&self, position: usize) -> u32 {
        if position >= self.source.len() {
            return (self.line_indices.len() + 1) as u32;
        }

        match self.line_indices.binary_search(&position) {
            Ok(index) => (index + 1) as u32,
            Err(index) => (index + 1) as u32,
        }
    }

    /// Returns the column number (1-based) for a given position in the source.
    pub fn get_column_number(&self, position: usize) -> u32 {
        if position >= self.source.len() {
            return 1;
        }
        let line_number = self.get_line_number(position);
        let line_start = if line_number == 1 {
            0
        } else {
            self.line_indices[(line_number - 2) as usize] + 1
        };
        (position - line_start + 1) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_numbers() {
        let map = SourceMap::new("one\ntwo\nthree".to_string());
        assert_eq!(map.get_line_number(0), 1);
        assert_eq!(map.get_line_number(4), 2);
        assert_eq!(map.get_line_number(8), 3);
    }

    #[test]
    fn test_column_numbers() {
        let map = SourceMap::new("ab\ncd".to_string());
        assert_eq!(map.get_column_number(0), 1);
        assert_eq!(map.get_column_number(1), 2);
        assert_eq!(map.get_column_number(3), 1);
        assert_eq!(map.get_column_number(4), 2);
    }

    #[test]
    fn test_newlines_inside_strings_count() {
        let map = SourceMap::new("var a = \"x\ny\";\nvar b;".to_string());
        let b_position = map
            .get_source()
            .iter()
            .enumerate()
            .rev()
            .find(|(_, c)| **c == 'b')
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(map.get_line_number(b_position), 3);
    }
}
