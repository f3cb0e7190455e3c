use threatmatch_url::{canonicalize, hash_prefixes, UrlError};

#[test]
fn test_canonicalize_reference_vectors() {
    let cases = [
        ("http://host/%25%32%35", "http://host/%25"),
        ("http://host/%25%32%35%25%32%35", "http://host/%25%25"),
        ("http://host/%2525252525252525", "http://host/%25"),
        ("http://host/asdf%25%32%35asd", "http://host/asdf%25asd"),
        ("http://host/%%%25%32%35asd%%", "http://host/%25%25%25asd%25%25"),
        ("http://www.google.com/", "http://www.google.com/"),
        (
            "http://%31%36%38%2e%31%38%38%2e%39%39%2e%32%36/%2E%73%65%63%75%72%65/%77%77%77%2E%65%62%61%79%2E%63%6F%6D/",
            "http://168.188.99.26/.secure/www.ebay.com/",
        ),
        (
            "http://195.127.0.11/uploads/%20%20%20%20/.verify/.eBaysecure=updateuserdataxplimnbqmn-xplmvalidateinfoswqpcmlx=hgplmcx/",
            "http://195.127.0.11/uploads/%20%20%20%20/.verify/.eBaysecure=updateuserdataxplimnbqmn-xplmvalidateinfoswqpcmlx=hgplmcx/",
        ),
        ("http://3279880203/blah", "http://195.127.0.11/blah"),
        ("http://www.google.com/blah/..", "http://www.google.com/"),
        ("www.google.com/", "http://www.google.com/"),
        ("www.google.com", "http://www.google.com/"),
        ("http://www.evil.com/blah#frag", "http://www.evil.com/blah"),
        ("http://www.GOOgle.com/", "http://www.google.com/"),
        ("http://www.google.com.../", "http://www.google.com/"),
        ("http://www.google.com/foo\tbar\rbaz\n2", "http://www.google.com/foobarbaz2"),
        ("http://www.google.com/q?", "http://www.google.com/q?"),
        ("http://www.google.com/q?r?", "http://www.google.com/q?r?"),
        ("http://www.google.com/q?r?s", "http://www.google.com/q?r?s"),
        ("http://evil.com/foo#bar#baz", "http://evil.com/foo"),
        ("http://evil.com/foo;", "http://evil.com/foo;"),
        ("http://evil.com/foo?bar;", "http://evil.com/foo?bar;"),
        ("http://notrailingslash.com", "http://notrailingslash.com/"),
        ("http://www.gotaport.com:1234/", "http://www.gotaport.com/"),
        ("  http://www.google.com/  ", "http://www.google.com/"),
        ("http:// leadingspace.com/", "http://%20leadingspace.com/"),
        ("http://%20leadingspace.com/", "http://%20leadingspace.com/"),
        ("%20leadingspace.com/", "http://%20leadingspace.com/"),
        ("https://www.securesite.com/", "https://www.securesite.com/"),
        ("http://host.com/ab%23cd", "http://host.com/ab%23cd"),
        (
            "http://host.com//twoslashes?more//slashes",
            "http://host.com/twoslashes?more//slashes",
        ),
    ];

    for (input, expected) in cases {
        let canonical = canonicalize(input)
            .unwrap_or_else(|e| panic!("failed to canonicalize {input:?}: {e}"));
        assert_eq!(canonical.to_string(), expected, "input: {input:?}");
    }
}

#[test]
fn test_canonicalize_idna_host() {
    let canonical = canonicalize("http://bücher.example/").unwrap();
    assert_eq!(canonical.host(), "xn--bcher-kva.example");
}

#[test]
fn test_canonicalize_ipv6_host_kept() {
    let canonical = canonicalize("http://[2001:DB8::1]:8080/path").unwrap();
    assert_eq!(canonical.host(), "[2001:db8::1]");
    assert!(canonical.is_ip_host());
}

#[test]
fn test_canonicalize_errors() {
    assert!(matches!(canonicalize(""), Err(UrlError::InvalidHost(_))));
    assert!(matches!(canonicalize("http://"), Err(UrlError::InvalidHost(_))));
    assert!(matches!(
        canonicalize("http:evil.com"),
        Err(UrlError::InvalidFormat(_))
    ));
    assert!(matches!(canonicalize("http://.../"), Err(UrlError::InvalidHost(_))));
}

fn sorted(mut hashes: Vec<String>) -> Vec<String> {
    hashes.sort();
    hashes
}

#[test]
fn test_hash_prefixes_phishing_page() {
    let hashes = hash_prefixes("http://testsafebrowsing.appspot.com/s/phishing.html").unwrap();
    let expected = vec![
        "5LHQQeEFQDzEIy87A/FRJOxSE5h1gllPDxitaGWLf1w=",
        "GrKy4W7cakmSUR5FwiFuAp8qTCym/b/SNkGBr11IGTE=",
        "771MOrRPMn6xPKlCrXx/CrR+wmCk0LgFFoSgGy7zUiA=",
        "1aBUzbFG9BknB+jc06PkAUscR06bSKE86nrqAglQX8E=",
        "pndXuMT6JnwSlt6nSrMcMFwEXdhZF6AXYmw/YK/O/OY=",
        "fYlbhlaZKG9iZg0Uu2J6FCYMbDypo5WZItm2XEPyCZ0=",
    ];
    assert_eq!(
        sorted(hashes),
        sorted(expected.into_iter().map(String::from).collect())
    );
}

#[test]
fn test_hash_prefixes_deep_path() {
    let hashes =
        hash_prefixes("https://testsafebrowsing.appspot.com/apiv4/IOS/MALWARE/URL/").unwrap();
    let expected = vec![
        "5LHQQeEFQDzEIy87A/FRJOxSE5h1gllPDxitaGWLf1w=",
        "z+nmEVNR0i8nIevlmsf/SAPyDLlmRfNla0J9lFBKL0A=",
        "8ieejNYYUpEh7oIOGvN9JulDqwUW8/aD0oe8rTfJiTw=",
        "e/8dHHRyCc1nJygNcHIJD6MTxyOphjISuJ4dYI6N//Y=",
        "6dT056kMid7yJkcBAQ/EtMiIj7b5ZuQKSIM1ZbXVb2U=",
        "1aBUzbFG9BknB+jc06PkAUscR06bSKE86nrqAglQX8E=",
        "pc1hwW5DPdxOpLODM+3to6nMq6J8tlH+x1Rcc3ZGAec=",
        "mqjxGQVdb+4TniGtrUdJAMBQnfSlpcJuidf+kulbI4s=",
        "pn7BBckKn7VVIbuLpRtKFCyprUR76hHEeu2/wk9QENg=",
        "fSk3abV8KY7dHqUi+j4rRi+cQYUZXYdCK2l9qOnsQl8=",
    ];
    assert_eq!(
        sorted(hashes),
        sorted(expected.into_iter().map(String::from).collect())
    );
}
