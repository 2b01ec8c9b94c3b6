//! Generated directory listings.

use std::fmt;
use std::io;

use chrono::{DateTime, Local};

use crate::fs::{DirEntry, FileSystem};
use crate::response::{HtmlEscaped, UrlEncoded};

/// Directory listing.
struct Listing<'a> {
    entries: &'a [DirEntry],
    has_parent: bool,
}

impl<'a> fmt::Display for Listing<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let max_len = self
            .entries
            .iter()
            .map(|entry| display_name_len(entry))
            .max()
            .unwrap_or(2);

        if self.has_parent {
            writeln!(f, "<a href=\"../\">../</a>")?;
        }
        for entry in self.entries {
            write!(
                f,
                "<a href=\"{}{}\">{}{}</a>",
                UrlEncoded(&entry.name),
                if entry.is_dir { "/" } else { "" },
                HtmlEscaped(&entry.name),
                if entry.is_dir { "/" } else { "" },
            )?;
            for _ in display_name_len(entry)..max_len + 1 {
                write!(f, " ")?;
            }
            let modified = DateTime::<Local>::from(entry.modified);
            write!(f, "{}", modified.format("%d-%b-%Y %H:%M"))?;
            if entry.is_dir {
                writeln!(f, "{:>12}", "-")?;
            } else {
                writeln!(f, "{:12}", entry.size)?;
            }
        }
        Ok(())
    }
}

fn display_name_len(entry: &DirEntry) -> usize {
    entry.name.chars().count() + usize::from(entry.is_dir)
}

/// HTML listing of the directory `dir`, served at `uri_path`.
pub fn render(
    fs: &dyn FileSystem,
    dir: &str,
    uri_path: &str,
    footer: &dyn fmt::Display,
) -> io::Result<String> {
    let mut entries = fs.read_dir(dir)?;
    // Hidden entries, including `.` and `..`, are not listed.
    entries.retain(|entry| !entry.name.starts_with('.'));
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(format!(
        "<html>\n<head>\n<title>Index of {}</title>\n\
        <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
        </head>\n<body>\n<h1>Index of {}</h1>\n<tt><pre>\n\
        {}\
        </pre></tt>\n\
        <hr>\n\
        {}\
        </body>\n</html>\n",
        HtmlEscaped(uri_path),
        HtmlEscaped(uri_path),
        Listing {
            entries: &entries,
            has_parent: uri_path != "/",
        },
        footer,
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::test_support::FakeFileSystem;

    #[test]
    fn lists_sorted_entries() {
        let fs = FakeFileSystem::new()
            .with_file("www/pub/b.txt", b"hello")
            .with_file("www/pub/a <&>.txt", b"")
            .with_dir("www/pub/sub")
            .with_file("www/pub/.hidden", b"");
        let page = render(&fs, "www/pub/", "/pub/", &"footer\n").unwrap();
        assert!(!page.contains(".hidden"));

        assert!(page.contains("<title>Index of /pub/</title>"));
        assert!(page.contains("<a href=\"../\">../</a>\n"));
        let a = page.find("a%20%3C%26%3E.txt").unwrap();
        let b = page.find("href=\"b.txt\"").unwrap();
        let sub = page.find("href=\"sub/\">sub/</a>").unwrap();
        assert!(a < b && b < sub);
        assert!(page.contains(">a &lt;&amp;&gt;.txt</a>"));
        assert!(page.ends_with("<hr>\nfooter\n</body>\n</html>\n"));
    }

    #[test]
    fn sizes_and_directories() {
        let fs = FakeFileSystem::new()
            .with_file("www/b.txt", b"hello")
            .with_dir("www/sub");
        let page = render(&fs, "www/", "/", &"").unwrap();
        assert!(!page.contains("../"));
        let file_line = page.lines().find(|line| line.contains("b.txt")).unwrap();
        assert!(file_line.ends_with("           5"));
        let dir_line = page.lines().find(|line| line.contains("sub/")).unwrap();
        assert!(dir_line.ends_with("           -"));
    }

    #[test]
    fn missing_directory_is_an_error() {
        let fs = FakeFileSystem::new();
        assert!(render(&fs, "www/nope/", "/nope/", &"").is_err());
    }
}
