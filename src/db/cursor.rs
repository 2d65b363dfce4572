use crate::common::{Error, Result};
use crate::db::SharedDb;
use crate::engine::{Entry, ScanRange};

/// Paged walk over a key range.
///
/// Each page is a separate scan that resumes after the last key returned, so
/// a cursor survives a leader change between pages. It does not see a
/// consistent snapshot across pages.
pub struct Cursor {
    db: SharedDb,
    range: ScanRange,
    page_size: usize,
    remaining: Option<usize>,
    done: bool,
}

impl Cursor {
    pub(crate) fn new(db: SharedDb, range: ScanRange, page_size: usize) -> Self {
        let remaining = range.limit;
        Self {
            db,
            range,
            page_size: page_size.max(1),
            remaining,
            done: false,
        }
    }

    /// Fetch the next page. `None` once the range is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Entry>>> {
        if self.done {
            return Ok(None);
        }
        let want = match self.remaining {
            Some(n) => n.min(self.page_size),
            None => self.page_size,
        };
        if want == 0 {
            self.done = true;
            return Ok(None);
        }

        let mut page = self.range.clone();
        page.limit = Some(want);
        let entries = self.db.scan(page).await?;
        check_page_len(want, entries.len())?;

        if entries.len() < want {
            self.done = true;
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= entries.len();
        }
        let Some(last) = entries.last() else {
            return Ok(None);
        };
        if self.range.reverse {
            self.range.lt = Some(last.key.clone());
            self.range.lte = None;
        } else {
            self.range.gt = Some(last.key.clone());
            self.range.gte = None;
        }
        Ok(Some(entries))
    }

    /// Drain the cursor into one vector.
    pub async fn collect(mut self) -> Result<Vec<Entry>> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }
}

/// Reject a page longer than the limit it was requested with.
fn check_page_len(want: usize, got: usize) -> Result<()> {
    if got > want {
        return Err(Error::Protocol(format!(
            "scan returned {} entries for a limit of {}",
            got, want
        )));
    }
    Ok(())
}
