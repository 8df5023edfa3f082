use chunkbox::utils::sanitize_filename;

#[test]
fn test_sanitize_filename() {
    // basic alphanumeric with extension
    assert_eq!(sanitize_filename("movie.mp4"), "movie.mp4");

    // directory traversal attempts
    assert_eq!(sanitize_filename("../movie.mp4"), "movie.mp4");
    assert_eq!(sanitize_filename("videos/movie.mp4"), "videosmovie.mp4");
    assert_eq!(sanitize_filename("/etc/passwd"), "etcpasswd");

    // special characters
    assert_eq!(sanitize_filename("backup-2024_01.tar.gz"), "backup-2024_01.tar.gz");
    assert_eq!(sanitize_filename("my file (1).zip"), "myfile1.zip");

    // leading dots
    assert_eq!(sanitize_filename(".hidden"), "hidden");
    assert_eq!(sanitize_filename("..hidden"), "hidden");

    // nothing usable left
    assert_eq!(sanitize_filename("../.."), "");
}
