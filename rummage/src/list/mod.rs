//! Driving a merged layer stack into an output sink.

pub mod output;

use std::io::{self, Write};

use futures_util::stream::{self, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;

pub use output::{LongOutput, Output, ShortOutput};

use crate::error::{Error, Result};
use crate::layer::Layer;
use crate::reader::{FileEntry, LayerStream, Merger};
use crate::source::Image;

/// Which listing to print.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Format {
    /// Paths only.
    #[default]
    Short,
    /// `tar -tv` style columns.
    Long,
}

impl Format {
    pub fn from_long_flag(long: bool) -> Self {
        if long { Format::Long } else { Format::Short }
    }

    pub fn sink<W: Write + Send + 'static>(self, out: W) -> Box<dyn Output + Send> {
        match self {
            Format::Short => Box::new(ShortOutput::new(out)),
            Format::Long => Box::new(LongOutput::new(out)),
        }
    }
}

impl<O: Output + ?Sized> Output for Box<O> {
    fn write(&mut self, entry: &FileEntry) -> io::Result<()> {
        (**self).write(entry)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// Write every entry to `sink`, then close it.
///
/// The token is checked before each entry. The sink is closed exactly once
/// whatever happens; its close error is only reported if nothing failed
/// earlier.
pub fn list<I, O>(entries: I, sink: &mut O, cancel: &CancellationToken) -> Result<()>
where
    I: IntoIterator<Item = Result<FileEntry>>,
    O: Output + ?Sized,
{
    let written = write_all(entries, sink, cancel);
    let closed = sink.close().map_err(Error::Output);
    written.and(closed)
}

fn write_all<I, O>(entries: I, sink: &mut O, cancel: &CancellationToken) -> Result<()>
where
    I: IntoIterator<Item = Result<FileEntry>>,
    O: Output + ?Sized,
{
    for entry in entries {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        sink.write(&entry?).map_err(Error::Output)?;
    }
    Ok(())
}

/// Open the layers of `image` and list their merged contents into `sink`.
///
/// Up to `concurrency` layers are fetched at once. The merge and the writes
/// run on a blocking thread.
pub async fn list_image<O>(
    image: &Image,
    mut sink: O,
    cancel: &CancellationToken,
    concurrency: usize,
) -> Result<()>
where
    O: Output + Send + 'static,
{
    let opened = tokio::select! {
        opened = open_layers(image.layers(), concurrency) => opened,
        _ = cancel.cancelled() => Err(Error::Cancelled),
    };
    let layers = match opened {
        Ok(layers) => layers,
        Err(e) => {
            // Nothing was written; closing only releases the sink.
            let _ = sink.close();
            return Err(e);
        }
    };

    tracing::debug!(image = %image.name(), layers = layers.len(), "merging layers");
    let cancel = cancel.clone();
    tokio::task::spawn_blocking(move || list(Merger::new(layers), &mut sink, &cancel))
        .await
        .map_err(|e| Error::Output(io::Error::other(e)))?
}

/// Open every layer, keeping base-first order.
async fn open_layers(layers: &[Layer], concurrency: usize) -> Result<Vec<LayerStream>> {
    stream::iter(layers)
        .map(|layer| async move {
            let reader = layer.open().await?;
            tracing::debug!(layer = %layer.digest(), "opened layer");
            Ok::<_, Error>(LayerStream::new(layer.digest(), reader))
        })
        .buffered(concurrency.max(1))
        .try_collect()
        .await
}
